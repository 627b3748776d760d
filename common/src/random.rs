use rand_core::{impls, Error, RngCore};

/// adapter so `rand`/`rand_distr` distributions sample from the global
/// `fastrand` state instead of a separately seeded generator
pub struct FastRand;

impl RngCore for FastRand {
    fn next_u32(&mut self) -> u32 {
        fastrand::u32(..)
    }

    fn next_u64(&mut self) -> u64 {
        fastrand::u64(..)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
