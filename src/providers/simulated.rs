use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{estimate_tokens, GenerationOptions, ProviderClient, UsageCounter, UsageStats};
use crate::error::ProviderError;
use crate::prompt::ITEM_MARKER;

/// Offline backend: answers every item in the prompt with a seeded random 1-5.
///
/// The number of answers is the number of item markers in the prompt (at
/// least one), written one per line so the parser reads them back in order.
pub struct SimulatedClient {
    rng: Mutex<StdRng>,
    usage: UsageCounter,
}

impl SimulatedClient {
    pub fn new(model: &str, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            usage: UsageCounter::new(model),
        }
    }
}

impl ProviderClient for SimulatedClient {
    fn generate_response(&self, prompt: &str, _options: &GenerationOptions) -> Result<String, ProviderError> {
        let items = prompt.matches(ITEM_MARKER).count().max(1);
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let text = (0..items)
            .map(|_| rng.gen_range(1..=5u8).to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.usage.record(estimate_tokens(prompt) + estimate_tokens(&text));
        Ok(text)
    }

    fn stats(&self) -> UsageStats {
        self.usage.snapshot()
    }

    fn reset_stats(&self) {
        self.usage.reset()
    }
}
