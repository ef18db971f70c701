//! The "exposed lazy sequence" from the data model: a single-producer,
//! single-consumer channel of events that also supports `close()` (terminate
//! normally) and `throw(err)` (terminate with error).
//!
//! Pushes are non-blocking — the channel is unbounded, so a consumer that
//! never drains it leaks memory. The design assumes timely consumption,
//! matching the source spec.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

enum Item<T, E> {
    Event(T),
    Done,
    Error(E),
}

/// Producer half of an event generator.
#[derive(Clone)]
pub struct EventGenerator<T, E> {
    tx: mpsc::UnboundedSender<Item<T, E>>,
}

impl<T, E> EventGenerator<T, E> {
    /// Push one event. Non-blocking; silently dropped if the consumer has
    /// already been dropped.
    pub fn push(&self, event: T) {
        let _ = self.tx.send(Item::Event(event));
    }

    /// Terminate the sequence normally. Idempotent from the producer's point
    /// of view (further pushes after close are simply ignored once the
    /// consumer observes the end).
    pub fn close(&self) {
        let _ = self.tx.send(Item::Done);
    }

    /// Terminate the sequence with an error.
    pub fn throw(&self, err: E) {
        let _ = self.tx.send(Item::Error(err));
    }
}

/// Consumer half: a finite, non-restartable async sequence.
pub struct EventStream<T, E> {
    rx: mpsc::UnboundedReceiver<Item<T, E>>,
    finished: bool,
}

/// Create a connected producer/consumer pair.
pub fn channel<T, E>() -> (EventGenerator<T, E>, EventStream<T, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventGenerator { tx },
        EventStream {
            rx,
            finished: false,
        },
    )
}

impl<T, E> EventStream<T, E> {
    /// Pull the next event, or `None` once the sequence has ended (normally
    /// or via error — an error is yielded exactly once as `Some(Err(_))`
    /// immediately before the sequence ends).
    pub async fn next(&mut self) -> Option<Result<T, E>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            None | Some(Item::Done) => {
                self.finished = true;
                None
            }
            Some(Item::Event(e)) => Some(Ok(e)),
            Some(Item::Error(e)) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    /// Drain the sequence, invoking `cb` for each successfully delivered
    /// event. Returns the terminal error, if any.
    pub async fn each(mut self, mut cb: impl FnMut(T)) -> Option<E> {
        loop {
            match self.next().await {
                Some(Ok(event)) => cb(event),
                Some(Err(e)) => return Some(e),
                None => return None,
            }
        }
    }
}

impl<T, E> Stream for EventStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) | Poll::Ready(Some(Item::Done)) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Item::Event(e))) => Poll::Ready(Some(Ok(e))),
            Poll::Ready(Some(Item::Error(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn push_then_close_is_observed_in_order() {
        let (gen_, mut stream) = channel::<i32, &'static str>();
        gen_.push(1);
        gen_.push(2);
        gen_.close();

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn throw_terminates_with_error() {
        let (gen_, mut stream) = channel::<i32, &'static str>();
        gen_.push(1);
        gen_.throw("boom");

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Err("boom")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn each_invokes_callback_per_event() {
        let (gen_, stream) = channel::<i32, &'static str>();
        gen_.push(1);
        gen_.push(2);
        gen_.push(3);
        gen_.close();

        let mut seen = Vec::new();
        let err = stream.each(|e| seen.push(e)).await;
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn stream_impl_matches_next() {
        let (gen_, stream) = channel::<i32, &'static str>();
        gen_.push(1);
        gen_.close();

        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected, vec![Ok(1)]);
    }
}
