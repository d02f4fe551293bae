/// Piece availability bitmap; bit `i` (MSB first) set means piece `i` is held.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn new(piece_count: u32) -> Self {
        Self(vec![0u8; piece_count.div_ceil(8) as usize])
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self(buf.to_vec())
    }

    /// Out-of-range indices are reported as missing.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;
        self.0
            .get(byte_index)
            .is_some_and(|byte| byte >> (7 - offset) & 1 != 0)
    }

    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;
        if let Some(byte) = self.0.get_mut(byte_index) {
            *byte |= 1 << (7 - offset);
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
