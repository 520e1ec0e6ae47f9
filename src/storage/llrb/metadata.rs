//! Bit-packed node metadata
//!
//! ## Layout
//! ```text
//! header: u64
//!   bits 52..63  unused
//!   bits 32..51  access, 20 bits
//!   bits 16..31  vbno
//!   bits  0..15  field mask (0x000f) and state flags (0xf000)
//! fields: u64 for each enabled field, in flag order
//!   bnseq (0x1), ddseq (0x2), mvalue (0x4), vbuuid (0x8)
//! ```
//! A tree fixes its field mask at creation, every node carries the same
//! optional fields and the metadata size is `8 + 8 * popcount(mask)`.

/// Born sequence number field
pub const MD_BNSEQ: u16 = 0x0001;
/// Dead sequence number field
pub const MD_DDSEQ: u16 = 0x0002;
/// Value handle field
pub const MD_MVALUE: u16 = 0x0004;
/// Replication uuid field
pub const MD_VBUUID: u16 = 0x0008;

const MD_FIELDS: u64 = 0x000f;
const MD_BLACK: u64 = 0x1000;
const MD_DIRTY: u64 = 0x2000;
const MD_DELETED: u64 = 0x4000;

const VBNO_SHIFT: u32 = 16;
const VBNO_MASK: u64 = 0xffff << VBNO_SHIFT;
const ACCESS_SHIFT: u32 = 32;
const ACCESS_MASK: u64 = 0xfffff << ACCESS_SHIFT;

/// Largest value the access field can hold.
pub const MAX_ACCESS: u64 = 0xfffff;

/// Number of enabled fields for every 4-bit mask.
const FIELD_COUNT: [usize; 16] = [0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4];

/// Optional fields present in every node of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMask(u16);

impl FieldMask {
    pub fn new(fields: u16) -> Self {
        assert!(fields as u64 & !MD_FIELDS == 0, "invalid metadata fields {:#x}", fields);
        Self(fields)
    }

    pub fn from_flags(bnseq: bool, ddseq: bool, mvalue: bool, vbuuid: bool) -> Self {
        let mut fields = 0;
        if bnseq {
            fields |= MD_BNSEQ;
        }
        if ddseq {
            fields |= MD_DDSEQ;
        }
        if mvalue {
            fields |= MD_MVALUE;
        }
        if vbuuid {
            fields |= MD_VBUUID;
        }
        Self(fields)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn has(self, field: u16) -> bool {
        self.0 & field != 0
    }

    /// Metadata size in bytes.
    pub fn sizeof(self) -> usize {
        8 + 8 * FIELD_COUNT[self.0 as usize]
    }

    /// Byte offset of an enabled `field`.
    fn offset(self, field: u16) -> usize {
        assert!(self.has(field), "metadata field {:#x} not enabled in {:#x}", field, self.0);
        8 + 8 * FIELD_COUNT[(self.0 & (field - 1)) as usize]
    }
}

/// View over metadata bytes, `B` is a slice or a mutable slice.
pub struct Metadata<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Metadata<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, off: usize) -> u64 {
        let buf = self.buf.as_ref();
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(word)
    }

    fn header(&self) -> u64 {
        self.word(0)
    }

    pub fn fields(&self) -> FieldMask {
        FieldMask((self.header() & MD_FIELDS) as u16)
    }

    pub fn sizeof(&self) -> usize {
        self.fields().sizeof()
    }

    pub fn is_black(&self) -> bool {
        self.header() & MD_BLACK != 0
    }

    pub fn is_red(&self) -> bool {
        !self.is_black()
    }

    pub fn is_dirty(&self) -> bool {
        self.header() & MD_DIRTY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.header() & MD_DELETED != 0
    }

    pub fn vbno(&self) -> u16 {
        ((self.header() & VBNO_MASK) >> VBNO_SHIFT) as u16
    }

    pub fn access(&self) -> u64 {
        (self.header() & ACCESS_MASK) >> ACCESS_SHIFT
    }

    pub fn bnseq(&self) -> u64 {
        self.word(self.fields().offset(MD_BNSEQ))
    }

    pub fn ddseq(&self) -> u64 {
        self.word(self.fields().offset(MD_DDSEQ))
    }

    pub fn mvalue(&self) -> u64 {
        self.word(self.fields().offset(MD_MVALUE))
    }

    pub fn vbuuid(&self) -> u64 {
        self.word(self.fields().offset(MD_VBUUID))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Metadata<B> {
    /// Reset to a red node carrying `fields`.
    pub fn init(&mut self, fields: FieldMask) -> &mut Self {
        let size = fields.sizeof();
        self.buf.as_mut()[..size].fill(0);
        self.set_header(fields.bits() as u64);
        self
    }

    fn set_word(&mut self, off: usize, value: u64) {
        self.buf.as_mut()[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn set_header(&mut self, header: u64) {
        self.set_word(0, header)
    }

    fn set_flag(&mut self, flag: u64, on: bool) -> &mut Self {
        let header = self.header();
        self.set_header(if on { header | flag } else { header & !flag });
        self
    }

    pub fn set_black(&mut self) -> &mut Self {
        self.set_flag(MD_BLACK, true)
    }

    pub fn set_red(&mut self) -> &mut Self {
        self.set_flag(MD_BLACK, false)
    }

    pub fn toggle_link(&mut self) -> &mut Self {
        let black = self.is_black();
        self.set_flag(MD_BLACK, !black)
    }

    pub fn set_dirty(&mut self, on: bool) -> &mut Self {
        self.set_flag(MD_DIRTY, on)
    }

    pub fn set_deleted(&mut self, on: bool) -> &mut Self {
        self.set_flag(MD_DELETED, on)
    }

    pub fn set_vbno(&mut self, vbno: u16) -> &mut Self {
        let header = (self.header() & !VBNO_MASK) | ((vbno as u64) << VBNO_SHIFT);
        self.set_header(header);
        self
    }

    /// Access is truncated to 20 bits.
    pub fn set_access(&mut self, access: u64) -> &mut Self {
        let access = (access & MAX_ACCESS) << ACCESS_SHIFT;
        let header = (self.header() & !ACCESS_MASK) | access;
        self.set_header(header);
        self
    }

    pub fn set_bnseq(&mut self, seqno: u64) -> &mut Self {
        let off = self.fields().offset(MD_BNSEQ);
        self.set_word(off, seqno);
        self
    }

    pub fn set_ddseq(&mut self, seqno: u64) -> &mut Self {
        let off = self.fields().offset(MD_DDSEQ);
        self.set_word(off, seqno);
        self
    }

    pub fn set_mvalue(&mut self, handle: u64) -> &mut Self {
        let off = self.fields().offset(MD_MVALUE);
        self.set_word(off, handle);
        self
    }

    pub fn set_vbuuid(&mut self, vbuuid: u64) -> &mut Self {
        let off = self.fields().offset(MD_VBUUID);
        self.set_word(off, vbuuid);
        self
    }
}
