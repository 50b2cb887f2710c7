use crate::codec::StreamDecoder;
use crate::config::ProtocolConfig;
use crate::error::ReplError;
use crate::protocol::Response;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receives every decoded response, one at a time, in arrival order.
#[async_trait::async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_response(&self, response: Response);
}

/// Why the read loop stopped.
#[derive(Debug)]
pub enum ReaderExit {
    /// The peer closed the connection between messages.
    Eof,
    /// Asked to stop.
    Shutdown,
    /// Malformed bytes or a socket error. Fatal for the connection.
    Failed(ReplError),
}

/// Read, decode and dispatch until the stream ends, fails or `shutdown` fires.
///
/// Each message is fully handled before the next read. Truncation markers are
/// applied before the handler sees a message; non-dictionary values are
/// logged and dropped.
pub async fn read_loop<R, H>(
    mut reader: R,
    handler: &H,
    mut shutdown: watch::Receiver<bool>,
) -> ReaderExit
where
    R: AsyncRead + Unpin,
    H: ResponseHandler + ?Sized,
{
    let mut decoder = StreamDecoder::new();
    let mut chunk = vec![0u8; ProtocolConfig::READ_CHUNK_SIZE];

    loop {
        loop {
            match decoder.next_value() {
                Ok(Some(value)) => match Response::from_value(value) {
                    Some(mut response) => {
                        response.apply_truncation();
                        debug!("RCV {}", response.value());
                        handler.on_response(response).await;
                    }
                    None => warn!("Dropping message that is not a dictionary"),
                },
                Ok(None) => break,
                Err(e) => return ReaderExit::Failed(e.into()),
            }
        }

        let read = tokio::select! {
            result = reader.read(&mut chunk) => result,
            _ = shutdown.changed() => return ReaderExit::Shutdown,
        };

        match read {
            Ok(0) => {
                return match decoder.finish() {
                    Ok(()) => ReaderExit::Eof,
                    Err(e) => ReaderExit::Failed(e.into()),
                };
            }
            Ok(n) => decoder.feed(&chunk[..n]),
            Err(e) => return ReaderExit::Failed(e.into()),
        }
    }
}
