use std::hash::{BuildHasher, Hasher};

// Jenkins Wiki: https://en.wikipedia.org/wiki/Jenkins_hash_function
// 64bit variant: http://burtleburtle.net/bob/hash/integer.html
#[derive(Default)]
pub struct Jenkins64Hasher(u64);

impl Jenkins64Hasher {
    fn jenkins(mut hash: u64) -> u64 {
        hash = hash
            .overflowing_shl(21)
            .0
            .overflowing_sub(hash)
            .0
            .overflowing_sub(1)
            .0;
        hash = hash ^ hash.overflowing_shr(24).0;
        hash = hash
            .overflowing_add(hash.overflowing_shl(3).0)
            .0
            .overflowing_add(hash.overflowing_shl(8).0)
            .0;
        hash = hash ^ hash.overflowing_shr(14).0;
        hash = hash
            .overflowing_add(hash.overflowing_shl(2).0)
            .0
            .overflowing_add(hash.overflowing_shl(4).0)
            .0;
        hash = hash ^ hash.overflowing_shr(28).0;
        hash = hash.overflowing_add(hash.overflowing_shl(31).0).0;

        hash
    }
}

impl BuildHasher for Jenkins64Hasher {
    type Hasher = Self;
    fn build_hasher(&self) -> Self::Hasher {
        Jenkins64Hasher(0)
    }
}

impl Hasher for Jenkins64Hasher {
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            if chunk.len() != 8 {
                // last bytes slice
                let mut byte_u64 = [0u8; 8];
                byte_u64[..chunk.len()].copy_from_slice(chunk);
                self.0 ^= Self::jenkins(u64::from_le_bytes(byte_u64));
                return;
            }
            let key = u64::from_le_bytes(*<&[u8; 8]>::try_from(chunk).unwrap());
            self.0 ^= Self::jenkins(key)
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
