use rand::RngCore;

/// Rolling 4-byte XOR mask.
///
/// The cursor survives between calls to [`MaskingKey::apply`], so a payload
/// that arrives in several reads can be unmasked chunk by chunk and produce
/// the same bytes as a single pass over the whole payload.
#[derive(Debug, Clone, Default)]
pub struct MaskingKey {
    key: [u8; 4],
    cursor: usize,
    present: bool,
}

impl MaskingKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh key from `rng`, cursor rewound.
    pub fn generate<R: RngCore + ?Sized>(&mut self, rng: &mut R) {
        self.reset();
        rng.fill_bytes(&mut self.key);
        self.present = true;
    }

    /// Installs a key chosen by the peer.
    pub fn set_key(&mut self, key: [u8; 4]) {
        self.key = key;
        self.cursor = 0;
        self.present = true;
    }

    pub fn key(&self) -> [u8; 4] {
        self.key
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        if !self.present {
            return;
        }
        for b in data.iter_mut() {
            *b ^= self.key[self.cursor];
            self.cursor = (self.cursor + 1) & 3;
        }
    }

    pub fn reset(&mut self) {
        self.key = [0; 4];
        self.cursor = 0;
        self.present = false;
    }
}
