use bitvec::vec::BitVec;

/// Hands out small integer ids, always reusing the lowest released one first.
///
/// One bit per id ever handed out; a set bit means the id is live.
#[derive(Default, Debug, Clone)]
pub struct IdAlloc {
    bits: BitVec,
}

impl IdAlloc {
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
        }
    }
    pub fn alloc_one(&mut self) -> u32 {
        if let Some(indice) = self.bits.first_zero() {
            self.bits.set(indice, true);
            return indice as u32;
        }
        let indice = self.bits.len();
        self.bits.push(true);
        indice as u32
    }
    pub fn free(&mut self, id: u32) {
        debug_assert!(self.is_live(id), "id {id} freed twice");
        self.bits.set(id as usize, false);
    }
    pub fn is_live(&self, id: u32) -> bool {
        self.bits.get(id as usize).is_some_and(|bit| *bit)
    }
    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }
    /// Releases every id at once.
    pub fn clear(&mut self) {
        self.bits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_lowest_released_id() {
        let mut ids = IdAlloc::new();
        assert_eq!(ids.alloc_one(), 0);
        assert_eq!(ids.alloc_one(), 1);
        assert_eq!(ids.alloc_one(), 2);
        ids.free(1);
        ids.free(0);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.alloc_one(), 0);
        assert_eq!(ids.alloc_one(), 1);
        assert_eq!(ids.alloc_one(), 3);
        assert!(ids.is_live(2));
    }

    #[test]
    fn clear_releases_everything() {
        let mut ids = IdAlloc::new();
        for _ in 0..10 {
            ids.alloc_one();
        }
        ids.clear();
        assert!(ids.is_empty());
        assert!(!ids.is_live(3));
        assert_eq!(ids.alloc_one(), 0);
    }
}
