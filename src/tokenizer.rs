use std::sync::Arc;

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

/// The two BPE tables every stored segment is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
}

static CL100K: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("load cl100k_base table"));
static O200K: Lazy<CoreBPE> = Lazy::new(|| o200k_base().expect("load o200k_base table"));

fn encoder(encoding: Encoding) -> &'static CoreBPE {
    match encoding {
        Encoding::Cl100kBase => &CL100K,
        Encoding::O200kBase => &O200K,
    }
}

/// Deterministic token count. Special-token spellings in the text are
/// counted as ordinary text.
pub fn count_tokens(text: &str, encoding: Encoding) -> usize {
    encoder(encoding).encode_ordinary(text).len()
}

/// Length function type injected into the segmenters. Callers may supply
/// their own; segmenters never assume tokens == characters.
pub type LengthFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

pub fn length_fn(encoding: Encoding) -> LengthFn {
    Arc::new(move |text| count_tokens(text, encoding))
}
