//! Reply worker (spec §4.6): the single thread that drains completed
//! inference results and hands each one to the configured
//! [`crate::backend::OutcomeReporter`] for delivery back to its origin.

use std::sync::Arc;

use crate::backend::{BackendResult, OutcomeReporter};
use crate::queue::BoundedQueue;

pub fn run(reply_queue: Arc<BoundedQueue<BackendResult>>, reporter: Arc<dyn OutcomeReporter>) {
    loop {
        let result = reply_queue.pop();
        reporter.report(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct CollectingReporter {
        seen: Mutex<Vec<BackendResult>>,
    }
    impl OutcomeReporter for CollectingReporter {
        fn report(&self, result: BackendResult) {
            self.seen.lock().push(result);
        }
    }

    #[test]
    fn reporter_receives_results_in_order() {
        let queue = Arc::new(BoundedQueue::unbounded());
        queue.push(BackendResult { qid: 1, sid: 1, is_parity: false, origin: 0, output: Some(Bytes::from_static(b"a")) });
        queue.push(BackendResult { qid: 2, sid: 1, is_parity: true, origin: 0, output: None });

        let reporter = Arc::new(CollectingReporter { seen: Mutex::new(Vec::new()) });
        // Drain exactly two results instead of looping `run` forever.
        let r1 = queue.pop();
        reporter.report(r1);
        let r2 = queue.pop();
        reporter.report(r2);

        let seen = reporter.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].qid, 1);
        assert_eq!(seen[1].qid, 2);
    }
}
