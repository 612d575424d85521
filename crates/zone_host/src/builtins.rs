//! Modules compiled into the host. They make up the built-in unit, which
//! declarations without a `unit` key resolve to.

use module_system::contracts::{ObscenityFilter, Prng};
use module_system::{async_trait, FnFactory, Module, ModuleContext, ModuleError, StaticUnit, BUILTIN_UNIT};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The unit holding every built-in module.
pub fn builtin_unit() -> StaticUnit {
    StaticUnit::new(BUILTIN_UNIT)
        .with_factory(FnFactory::new("prng", || Box::new(PrngModule) as Box<dyn Module>))
        .with_factory(FnFactory::new("obscenity", || {
            Box::new(ObscenityModule) as Box<dyn Module>
        }))
}

/// Xorshift generator with a lock-free shared state.
pub struct XorShiftPrng {
    state: AtomicU64,
}

impl XorShiftPrng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves the all-zero state
        Self {
            state: AtomicU64::new(seed.max(1)),
        }
    }

    pub fn from_entropy() -> Self {
        Self::new(Uuid::new_v4().as_u128() as u64)
    }

    fn step(&self) -> u64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let mut next = current;
            next ^= next << 13;
            next ^= next >> 7;
            next ^= next << 17;
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Prng for XorShiftPrng {
    fn fill_secure(&self, buf: &mut [u8]) -> bool {
        // Bytes 6 and 8 of a v4 uuid carry version and variant bits.
        const RANDOM_BYTES: [usize; 14] = [0, 1, 2, 3, 4, 5, 7, 9, 10, 11, 12, 13, 14, 15];
        for chunk in buf.chunks_mut(RANDOM_BYTES.len()) {
            let id = Uuid::new_v4();
            let bytes = id.as_bytes();
            for (slot, index) in chunk.iter_mut().zip(RANDOM_BYTES) {
                *slot = bytes[index];
            }
        }
        true
    }

    fn fill_fast(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn below(&self, bound: u32) -> u32 {
        ((u64::from(self.next_u32()) * u64::from(bound)) >> 32) as u32
    }

    fn next_u32(&self) -> u32 {
        (self.step() >> 32) as u32
    }

    fn uniform(&self) -> f64 {
        (self.step() >> 11) as f64 / (1u64 << 53) as f64
    }
}

struct PrngModule;

#[async_trait]
impl Module for PrngModule {
    fn name(&self) -> &str {
        "prng"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        ctx.register_interface::<dyn Prng>(Arc::new(XorShiftPrng::from_entropy()))?;
        Ok(())
    }
}

/// Masks listed words, matched case-insensitively on word boundaries.
pub struct WordListFilter {
    words: HashSet<String>,
}

impl WordListFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|word| word.as_ref().to_lowercase())
                .collect(),
        }
    }

    fn push_word(&self, out: &mut String, word: &str) -> bool {
        if self.words.contains(&word.to_lowercase()) {
            out.extend(std::iter::repeat('*').take(word.chars().count()));
            true
        } else {
            out.push_str(word);
            false
        }
    }
}

impl ObscenityFilter for WordListFilter {
    fn filter(&self, text: &mut String) -> bool {
        let mut out = String::with_capacity(text.len());
        let mut replaced = false;
        let mut start = None;

        for (index, ch) in text.char_indices() {
            if ch.is_alphanumeric() {
                if start.is_none() {
                    start = Some(index);
                }
            } else {
                if let Some(begin) = start.take() {
                    replaced |= self.push_word(&mut out, &text[begin..index]);
                }
                out.push(ch);
            }
        }
        if let Some(begin) = start {
            replaced |= self.push_word(&mut out, &text[begin..]);
        }

        if replaced {
            *text = out;
        }
        replaced
    }
}

const DEFAULT_WORDS: [&str; 3] = ["darn", "heck", "frak"];

struct ObscenityModule;

#[async_trait]
impl Module for ObscenityModule {
    fn name(&self) -> &str {
        "obscenity"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        let filter = WordListFilter::new(DEFAULT_WORDS);
        debug!("Obscenity filter loaded with {} words", filter.words.len());
        ctx.register_interface::<dyn ObscenityFilter>(Arc::new(filter))?;
        Ok(())
    }
}
