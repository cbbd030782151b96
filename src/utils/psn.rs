use crate::rdma::Psn;

/// Generate a random 24-bit initial packet sequence number.
#[inline]
pub(crate) fn random_psn() -> Psn {
    rand::random::<u32>() & 0xFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_24_bits() {
        let psns = (0..64).map(|_| random_psn()).collect::<Vec<_>>();
        assert!(psns.iter().all(|&psn| psn <= 0xFF_FFFF));
        assert!(psns.iter().any(|&psn| psn != psns[0]));
    }
}
