//! Per-invocation build state: randomness, keys, and fresh names.
//!
//! One context per pipeline run. Keys come from OS entropy and never leave
//! the invocation; concurrent runs each build their own context, so nothing
//! here is shared or reused.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

/// Decoy identifier pool used when the memes toggle is on. Cosmetic only.
const MEME_NAMES: &[&str] = &[
    "hotel_trivago",
    "spaghetti_code",
    "free_robux",
    "certified_moment",
    "skill_issue",
    "touch_grass",
    "no_cap",
    "sus_amogus",
];

pub struct BuildContext {
    rng: StdRng,
    memes: bool,
    used_names: HashSet<String>,
    counter: u32,
}

impl BuildContext {
    /// Fresh context with OS-seeded randomness.
    pub fn new(memes: bool) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            memes,
            used_names: HashSet::new(),
            counter: 0,
        }
    }

    /// Deterministic context for tests.
    pub fn with_seed(seed: u64, memes: bool) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            memes,
            used_names: HashSet::new(),
            counter: 0,
        }
    }

    pub fn memes(&self) -> bool {
        self.memes
    }

    /// Mark identifiers that already appear in the source so generated
    /// names can never collide with them.
    pub fn reserve_names<I: IntoIterator<Item = String>>(&mut self, names: I) {
        self.used_names.extend(names);
    }

    /// A fresh identifier, never equal to a reserved or previously
    /// generated name.
    pub fn fresh_name(&mut self) -> String {
        loop {
            self.counter += 1;
            let candidate = if self.memes {
                let word = MEME_NAMES[self.rng.gen_range(0..MEME_NAMES.len())];
                format!("{}_{}", word, self.counter)
            } else {
                format!("_0x{:04x}{:02x}", self.rng.gen::<u16>(), self.counter & 0xff)
            };
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Key for the string-encryption cipher (never zero).
    pub fn string_key(&mut self) -> u8 {
        self.rng.gen_range(1..=255)
    }

    /// A dispatch-state number not used before in this context.
    pub fn fresh_state_number(&mut self, taken: &mut HashSet<u32>) -> u32 {
        loop {
            let n = self.rng.gen_range(1..=9_999_999);
            if taken.insert(n) {
                return n;
            }
        }
    }

    pub fn gen_range(&mut self, upper: usize) -> usize {
        self.rng.gen_range(0..upper)
    }

    pub fn gen_bool(&mut self) -> bool {
        self.rng.gen()
    }

    /// Derive the packer keystream seed: random key material through the
    /// SHA-256 schedule, folded to the u32 the loader embeds.
    pub fn packer_seed(&mut self) -> u32 {
        let mut key = [0u8; 16];
        self.rng.fill_bytes(&mut key);
        let digest = Sha256::digest(key);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_are_unique() {
        let mut ctx = BuildContext::with_seed(1, false);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(ctx.fresh_name()));
        }
    }

    #[test]
    fn fresh_names_avoid_reserved() {
        let mut ctx = BuildContext::with_seed(2, false);
        let name = BuildContext::with_seed(2, false).fresh_name();
        ctx.reserve_names([name.clone()]);
        for _ in 0..100 {
            assert_ne!(ctx.fresh_name(), name);
        }
    }

    #[test]
    fn meme_names_use_the_pool() {
        let mut ctx = BuildContext::with_seed(3, true);
        let name = ctx.fresh_name();
        assert!(MEME_NAMES.iter().any(|w| name.starts_with(w)));
    }

    #[test]
    fn seeds_differ_across_contexts() {
        // OS-entropy contexts must not repeat key material.
        let mut a = BuildContext::new(false);
        let mut b = BuildContext::new(false);
        assert_ne!(a.packer_seed(), b.packer_seed());
    }

    #[test]
    fn string_key_is_never_zero() {
        let mut ctx = BuildContext::with_seed(4, false);
        for _ in 0..500 {
            assert_ne!(ctx.string_key(), 0);
        }
    }
}
