//! Blocking message loops on dedicated threads.
//!
//! The reactor never runs application code. These helpers give each ring
//! half its own thread and call back into the application once per message,
//! until the ring closes.

use bytes::BytesMut;
use slotnet_core::buffer::{BufferConsumer, BufferProducer};
use slotnet_core::error::{Result, SlotError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Call `handler` with every message read from `input`.
///
/// The thread ends with the number of messages handled once `input` is
/// closed and drained, or with the first error `handler` returns (in which
/// case `input` is closed).
pub fn spawn_consumer<F>(
    name: impl Into<String>,
    mut input: BufferConsumer,
    mut handler: F,
) -> Result<JoinHandle<Result<u64>>>
where
    F: FnMut(&[u8]) -> Result<()> + Send + 'static,
{
    let name = name.into();
    let thread_name = name.clone();
    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        let mut handled = 0u64;
        loop {
            let message = match input.acquire() {
                Ok(message) => message,
                Err(SlotError::Closed) => break,
                Err(e) => return Err(e),
            };
            let outcome = handler(&message[..]);
            message.release();
            if let Err(e) = outcome {
                warn!(%name, "[HANDLER] Consumer stopped: {}", e);
                input.close();
                return Err(e);
            }
            handled += 1;
        }
        debug!(%name, handled, "[HANDLER] Consumer finished");
        Ok(handled)
    })?;
    Ok(handle)
}

/// Fill one slot of `output` per call to `producer`.
///
/// `producer` writes the next payload into the slot and returns `true` to
/// send it, or `false` to stop (the slot is discarded). The thread ends with
/// the number of messages sent, or with the first error.
pub fn spawn_producer<F>(
    name: impl Into<String>,
    mut output: BufferProducer,
    mut producer: F,
) -> Result<JoinHandle<Result<u64>>>
where
    F: FnMut(&mut BytesMut) -> Result<bool> + Send + 'static,
{
    let name = name.into();
    let thread_name = name.clone();
    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        let mut sent = 0u64;
        loop {
            let mut slot = match output.acquire() {
                Ok(slot) => slot,
                Err(SlotError::Closed) => break,
                Err(e) => return Err(e),
            };
            if !producer(&mut *slot)? {
                break;
            }
            slot.release()?;
            sent += 1;
        }
        debug!(%name, sent, "[HANDLER] Producer finished");
        Ok(sent)
    })?;
    Ok(handle)
}

/// Send every message read from `input` back out through `output`.
pub fn spawn_echo(
    name: impl Into<String>,
    input: BufferConsumer,
    mut output: BufferProducer,
) -> Result<JoinHandle<Result<u64>>> {
    spawn_consumer(name, input, move |message| output.send(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use slotnet_core::buffer::MessageBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_consumer_drains_until_closed() {
        let (mut producer, consumer) = MessageBuffer::bounded(4, 16).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&total);
        let handle = spawn_consumer("consumer-test", consumer, move |message| {
            counter.fetch_add(message.len(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        for i in 1..=10usize {
            producer.send(&vec![b'x'; i]).unwrap();
        }
        producer.close();
        assert_eq!(handle.join().unwrap().unwrap(), 10);
        assert_eq!(total.load(Ordering::SeqCst), (1..=10).sum::<usize>());
    }

    #[test]
    fn test_consumer_error_closes_input() {
        let (mut producer, consumer) = MessageBuffer::bounded(4, 16).unwrap();
        let handle = spawn_consumer("consumer-error", consumer, |message| {
            if message == b"stop" {
                Err(SlotError::illegal_state("stop requested"))
            } else {
                Ok(())
            }
        })
        .unwrap();
        producer.send(b"go").unwrap();
        producer.send(b"stop").unwrap();
        assert!(matches!(handle.join().unwrap(), Err(SlotError::IllegalState(_))));
        assert!(producer.is_closed());
    }

    #[test]
    fn test_producer_stops_on_false() {
        let (producer, mut consumer) = MessageBuffer::bounded(8, 16).unwrap();
        let mut next = 0u8;
        let handle = spawn_producer("producer-test", producer, move |slot| {
            if next == 5 {
                return Ok(false);
            }
            slot.put_u8(next);
            next += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 5);
        for i in 0..5u8 {
            assert_eq!(&consumer.recv().unwrap()[..], &[i]);
        }
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_echo_copies_messages() {
        let (mut request_tx, request_rx) = MessageBuffer::bounded(4, 32).unwrap();
        let (reply_tx, mut reply_rx) = MessageBuffer::bounded(4, 32).unwrap();
        let handle = spawn_echo("echo-test", request_rx, reply_tx).unwrap();
        request_tx.send(b"ping").unwrap();
        assert_eq!(&reply_rx.recv().unwrap()[..], b"ping");
        request_tx.close();
        assert_eq!(handle.join().unwrap().unwrap(), 1);
    }
}
