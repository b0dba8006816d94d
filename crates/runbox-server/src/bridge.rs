//! Bidirectional relay between a client websocket and a sandbox stream.
//!
//! Two pumps run concurrently, one per direction, and share a single
//! [`CancellationToken`]. Whichever pump stops first cancels it, and the bridge
//! returns as soon as it is cancelled. The bridge does not care which side
//! ended the session.

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use runbox_core::{AttachedStream, RuntimeError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// A duplex websocket connection to a client.
///
/// Implemented for axum's `WebSocket` and anything else with the same shape.
pub trait ClientSocket:
    Stream<Item = Result<Message, axum::Error>> + Sink<Message, Error = axum::Error> + Unpin + Send
{
}

impl<T> ClientSocket for T where
    T: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Unpin
        + Send
{
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// Source sent a close frame or ended.
    Closed,
    ReadFailed(String),
    WriteFailed(String),
    /// The other pump stopped first.
    Cancelled,
}

pub(crate) fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}

/// Client to sandbox: binary frames are written to stdin verbatim, close ends
/// the pump, anything else is dropped.
pub async fn pump_client_to_environment<R, W>(
    client: &mut R,
    input: &mut W,
    done: &CancellationToken,
) -> PumpExit
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let _stop = done.clone().drop_guard();
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => return PumpExit::Cancelled,
            message = client.next() => message,
        };
        match message {
            None | Some(Ok(Message::Close(_))) => return PumpExit::Closed,
            Some(Err(e)) => return PumpExit::ReadFailed(e.to_string()),
            Some(Ok(Message::Binary(data))) => {
                let written = async {
                    input.write_all(&data).await?;
                    input.flush().await
                };
                if let Err(e) = written.await {
                    return PumpExit::WriteFailed(e.to_string());
                }
            }
            Some(Ok(other)) => {
                log::trace!("Dropping {} frame from client", frame_kind(&other));
            }
        }
    }
}

/// Sandbox to client: every output chunk becomes one binary frame.
pub async fn pump_environment_to_client<S, K>(
    output: &mut S,
    client: &mut K,
    done: &CancellationToken,
) -> PumpExit
where
    S: Stream<Item = Result<Bytes, RuntimeError>> + Unpin + ?Sized,
    K: Sink<Message, Error = axum::Error> + Unpin,
{
    let _stop = done.clone().drop_guard();
    loop {
        let chunk = tokio::select! {
            _ = done.cancelled() => return PumpExit::Cancelled,
            chunk = output.next() => chunk,
        };
        match chunk {
            None => return PumpExit::Closed,
            Some(Err(e)) => return PumpExit::ReadFailed(e.to_string()),
            Some(Ok(data)) => {
                if let Err(e) = client.send(Message::Binary(data)).await {
                    return PumpExit::WriteFailed(e.to_string());
                }
            }
        }
    }
}

/// Relay between `client` and `stream` until either side closes or fails.
///
/// No timeout applies here; the session lasts as long as both parties keep
/// their ends open. When one pump stops, the other is abandoned wherever it
/// is, and the caller is expected to tear the sandbox down next.
pub async fn bridge<C: ClientSocket>(session_id: &str, client: &mut C, stream: &mut AttachedStream) {
    let done = CancellationToken::new();
    let (mut client_tx, mut client_rx) = client.split();
    let AttachedStream { output, input } = stream;

    let upstream = async {
        let exit = pump_client_to_environment(&mut client_rx, input, &done).await;
        log::debug!("Session {}: client -> sandbox pump stopped: {:?}", session_id, exit);
    };
    let downstream = async {
        let exit = pump_environment_to_client(output, &mut client_tx, &done).await;
        log::debug!("Session {}: sandbox -> client pump stopped: {:?}", session_id, exit);
    };
    let pumps = async { tokio::join!(upstream, downstream) };

    tokio::select! {
        _ = done.cancelled() => {}
        _ = pumps => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn recording_sink(
        sent: &mut Vec<Message>,
    ) -> impl Sink<Message, Error = axum::Error> + Unpin + '_ {
        sent.sink_map_err(|never: Infallible| -> axum::Error { match never {} })
    }

    fn client_frames(frames: Vec<Message>) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        stream::iter(frames.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_client_binary_frames_reach_stdin_in_order() {
        let done = CancellationToken::new();
        let (mut session_side, mut container_side) = tokio::io::duplex(1024);
        let mut client = client_frames(vec![
            Message::Binary(Bytes::from_static(b"print(")),
            Message::Text("ignored".into()),
            Message::Ping(Bytes::from_static(b"p")),
            Message::Binary(Bytes::from_static(b"1)\n")),
            Message::Close(None),
            Message::Binary(Bytes::from_static(b"after close")),
        ]);

        let exit = pump_client_to_environment(&mut client, &mut session_side, &done).await;
        assert_eq!(exit, PumpExit::Closed);
        assert!(done.is_cancelled());

        drop(session_side);
        let mut seen = Vec::new();
        container_side.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"print(1)\n");
    }

    #[tokio::test]
    async fn test_client_read_error_stops_pump() {
        let done = CancellationToken::new();
        let (mut session_side, _container_side) = tokio::io::duplex(1024);
        let mut client = stream::iter(vec![Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )))]);

        let exit = pump_client_to_environment(&mut client, &mut session_side, &done).await;
        assert!(matches!(exit, PumpExit::ReadFailed(_)));
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn test_stdin_write_error_stops_pump() {
        let done = CancellationToken::new();
        let (mut session_side, container_side) = tokio::io::duplex(1024);
        drop(container_side);
        let mut client = client_frames(vec![Message::Binary(Bytes::from_static(b"x"))]);

        let exit = pump_client_to_environment(&mut client, &mut session_side, &done).await;
        assert!(matches!(exit, PumpExit::WriteFailed(_)));
    }

    #[tokio::test]
    async fn test_output_chunks_become_binary_frames() {
        let done = CancellationToken::new();
        let mut output = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let mut sent: Vec<Message> = Vec::new();
        let mut sink = recording_sink(&mut sent);

        let exit = pump_environment_to_client(&mut output, &mut sink, &done).await;
        drop(sink);
        assert_eq!(exit, PumpExit::Closed);
        assert!(done.is_cancelled());
        assert_eq!(
            sent,
            vec![
                Message::Binary(Bytes::from_static(b"hello ")),
                Message::Binary(Bytes::from_static(b"world")),
            ]
        );
    }

    #[tokio::test]
    async fn test_output_error_stops_pump() {
        let done = CancellationToken::new();
        let mut output = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(RuntimeError::failed("container died")),
            Ok(Bytes::from_static(b"never sent")),
        ]);
        let mut sent: Vec<Message> = Vec::new();
        let mut sink = recording_sink(&mut sent);

        let exit = pump_environment_to_client(&mut output, &mut sink, &done).await;
        drop(sink);
        assert_eq!(exit, PumpExit::ReadFailed("container died".to_string()));
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pump_stops_waiting() {
        let done = CancellationToken::new();
        let mut output = stream::pending::<Result<Bytes, RuntimeError>>();
        let mut sent: Vec<Message> = Vec::new();
        let mut sink = recording_sink(&mut sent);

        let canceller = done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let exit = pump_environment_to_client(&mut output, &mut sink, &done).await;
        assert_eq!(exit, PumpExit::Cancelled);
    }
}
