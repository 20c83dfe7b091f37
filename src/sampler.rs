/// Receives per-service sampling rates returned by the agent.
///
/// After a successful trace submission the agent may respond with a
/// `rate_by_service` object mapping `"service:<name>,env:<env>"` keys to
/// sampling rates. The writer hands that object to this sink as a compact
/// JSON string, keeping the sampler decoupled from the writer's JSON
/// machinery. Implementations provide their own thread safety; the writer
/// calls `apply_rates` from its worker thread without additional
/// serialization.
pub trait SamplerFeedback: Send + Sync {
    fn apply_rates(&self, rates: &str);
}

/// A [`SamplerFeedback`] that ignores all rate updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSamplerFeedback;

impl SamplerFeedback for NoopSamplerFeedback {
    fn apply_rates(&self, _rates: &str) {}
}
