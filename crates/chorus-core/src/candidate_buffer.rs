//! Holding pen for remote candidates that race ahead of the remote description.
//!
//! A connection rejects candidates until it has a remote description, so the
//! buffer keeps them in arrival order and releases them exactly once, right
//! after that description is applied. From then on it is a pass-through.

use std::collections::VecDeque;
use std::future::Future;

#[derive(Debug)]
pub struct CandidateBuffer<T> {
    pending: VecDeque<T>,
    drained: bool,
}

impl<T> Default for CandidateBuffer<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            drained: false,
        }
    }
}

impl<T> CandidateBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Queue `candidate`, or hand it straight to `apply` once the buffer has
    /// been drained. Returns `true` when the candidate was applied.
    pub async fn enqueue<F, Fut, E>(&mut self, candidate: T, mut apply: F) -> Result<bool, E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self.drained {
            apply(candidate).await?;
            return Ok(true);
        }
        self.pending.push_back(candidate);
        Ok(false)
    }

    /// Apply every buffered candidate in arrival order and switch to
    /// pass-through mode. A second call is a no-op.
    ///
    /// The buffer counts as drained even if `apply` fails part way; the
    /// remaining candidates are dropped with it.
    pub async fn drain_into<F, Fut, E>(&mut self, mut apply: F) -> Result<usize, E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self.drained {
            tracing::warn!(
                target = "mesh",
                leftover = self.pending.len(),
                "candidate buffer drained twice; ignoring"
            );
            return Ok(0);
        }
        self.drained = true;

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            if let Err(err) = apply(candidate).await {
                self.pending.clear();
                return Err(err);
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Throw away whatever is still queued. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (
        Arc<Mutex<Vec<&'static str>>>,
        impl FnMut(&'static str) -> std::future::Ready<Result<(), ()>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let apply = move |candidate| {
            sink.lock().unwrap().push(candidate);
            std::future::ready(Ok(()))
        };
        (log, apply)
    }

    #[tokio::test]
    async fn drains_in_arrival_order_exactly_once() {
        let (log, mut apply) = recorder();
        let mut buffer = CandidateBuffer::new();

        for candidate in ["c1", "c2", "c3"] {
            let applied = buffer.enqueue(candidate, &mut apply).await.unwrap();
            assert!(!applied);
        }
        assert!(log.lock().unwrap().is_empty());

        let applied = buffer.drain_into(&mut apply).await.unwrap();
        assert_eq!(applied, 3);
        assert_eq!(*log.lock().unwrap(), vec!["c1", "c2", "c3"]);

        let again = buffer.drain_into(&mut apply).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn enqueue_after_drain_applies_immediately() {
        let (log, mut apply) = recorder();
        let mut buffer = CandidateBuffer::new();
        buffer.drain_into(&mut apply).await.unwrap();

        let applied = buffer.enqueue("late", &mut apply).await.unwrap();
        assert!(applied);
        assert!(buffer.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[tokio::test]
    async fn failed_apply_stops_drain_and_drops_the_rest() {
        let mut buffer = CandidateBuffer::new();
        let mut noop = |_: u8| std::future::ready(Ok::<(), &'static str>(()));
        for candidate in 1..=3u8 {
            buffer.enqueue(candidate, &mut noop).await.unwrap();
        }

        let mut seen = Vec::new();
        let result = buffer
            .drain_into(|candidate| {
                seen.push(candidate);
                std::future::ready(if candidate == 2 { Err("rejected") } else { Ok(()) })
            })
            .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(seen, vec![1, 2]);
        assert!(buffer.is_drained());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn discard_empties_pending_candidates() {
        let mut buffer = CandidateBuffer::new();
        let mut noop = |_: u8| std::future::ready(Ok::<(), ()>(()));
        buffer.enqueue(7, &mut noop).await.unwrap();
        buffer.enqueue(8, &mut noop).await.unwrap();

        assert_eq!(buffer.discard(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.is_drained());
    }
}
