//! In-memory websocket pair for driving sessions from tests.

use axum::extract::ws::Message;
use futures_util::{Sink, Stream};
use runbox_server::StatusUpdate;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Server side of the connection, handed to the session.
pub struct TestSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// Client side of the connection, kept by the test.
pub struct TestClient {
    tx: Option<mpsc::UnboundedSender<Result<Message, axum::Error>>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

pub fn socket_pair() -> (TestSocket, TestClient) {
    let (client_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, client_rx) = mpsc::unbounded_channel();
    (
        TestSocket { incoming, outgoing },
        TestClient {
            tx: Some(client_tx),
            rx: client_rx,
        },
    )
}

fn gone() -> axum::Error {
    axum::Error::new(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "client gone",
    ))
}

impl Stream for TestSocket {
    type Item = Result<Message, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_recv(cx)
    }
}

impl Sink<Message> for TestSocket {
    type Error = axum::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.outgoing.is_closed() {
            Poll::Ready(Err(gone()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outgoing.send(item).map_err(|_| gone())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl TestClient {
    pub fn send(&self, message: Message) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(message));
        }
    }

    /// Stop sending; the session sees the read side end.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Next frame from the server, failing the test if none arrives in time.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(300), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn recv_status(&mut self) -> StatusUpdate {
        match self.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a status frame, got {:?}", other),
        }
    }

    /// Everything the server sent until it dropped its side.
    pub async fn remaining(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }
}

pub fn is_close(message: &Message) -> bool {
    matches!(message, Message::Close(_))
}
