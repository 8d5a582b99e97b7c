//! Decode Stream Adapter
//!
//! Runs a [`Decoder`] over a connection's read half on its own Tokio task
//! and hands decoded units to the connection handler through a small
//! bounded channel. Units arrive in stream order (single producer, single
//! consumer). The channel closes exactly once, when the decoder reports a
//! fatal error, the task faults, or the consumer goes away.
//!
//! ```text
//!  socket read half ──▶ [decode task] ──mpsc──▶ DecodeStream::recv()
//! ```

use crate::panic_message;
use crate::protocol::decoder::{DecodeError, Decoder, Payload};
use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

/// Capacity of the channel between the decode task and its consumer
pub const DECODE_CHANNEL_CAPACITY: usize = 16;

/// Receiving end of a running decode task.
///
/// Dropping the stream aborts the decode task, which releases the byte
/// source it owns.
#[derive(Debug)]
pub struct DecodeStream {
    units: mpsc::Receiver<Payload>,
    task: JoinHandle<()>,
}

impl DecodeStream {
    /// Starts decoding `reader` on a new task.
    ///
    /// The reader is moved into the task, so one byte source can only ever
    /// feed one decoder.
    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, units) = mpsc::channel(DECODE_CHANNEL_CAPACITY);
        let task = tokio::spawn(decode_task(Decoder::new(reader), tx).in_current_span());
        Self { units, task }
    }

    /// Receives the next unit, or `None` once the input has ended.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.units.recv().await
    }
}

impl Stream for DecodeStream {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        self.units.poll_recv(cx)
    }
}

impl Drop for DecodeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn decode_task<R>(mut decoder: Decoder<R>, tx: mpsc::Sender<Payload>)
where
    R: AsyncRead + Unpin,
{
    let pump = async {
        while let Some(unit) = decoder.next_unit().await {
            if tx.send(unit).await.is_err() {
                debug!("Decode consumer dropped, stopping");
                return;
            }
        }
    };

    if let Err(panic) = AssertUnwindSafe(pump).catch_unwind().await {
        let msg = panic_message(&*panic);
        error!(error = %msg, "Decode task panicked");
        let _ = tx.send(Err(DecodeError::Internal(msg))).await;
    }
    // `tx` drops here, closing the channel
}
