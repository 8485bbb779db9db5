//! Trivial extension point for the ARIMA flagging mode (SPEC_FULL §C.1).
//!
//! The reference's `algorithm: "arima"` mode fits an ARIMA model over each
//! zone's recent preemption history to forecast the next slice's available
//! count, then flags proactively rather than reactively. Fitting an actual
//! ARIMA model is out of scope here; this trait is the seam a real
//! predictor would plug into, and the default implementation falls back to
//! "predict no change" so `algorithm: "arima"` degrades gracefully to
//! baseline behavior rather than failing to load.

/// Forecasts the next available-node count for a zone from its recent
/// history. `history` is oldest-first.
pub trait Predictor: Send + Sync {
    fn predict_next(&self, history: &[u32]) -> Option<u32>;
}

/// Last-value predictor: forecasts that the next slice matches the most
/// recent observed one. Stands in for a fitted ARIMA(p, d, q) model until
/// one is wired in; `max_p`/`max_d`/`max_q` from `ArimaConfig` are accepted
/// so a real implementation can size itself, but are unused here.
pub struct NaivePredictor;

impl Predictor for NaivePredictor {
    fn predict_next(&self, history: &[u32]) -> Option<u32> {
        history.last().copied()
    }
}
