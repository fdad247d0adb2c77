use crg_api::StateCache;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Connected,
    Disconnected,
    /// The cache went dirty: a snapshot is worth re-extracting.
    StateChanged,
    Error(String),
}

/// Reconnecting websocket client for the scoreboard's live feed. Applies
/// inbound `state` deltas to the shared cache and raises [`FeedEvent`]s;
/// the consumer owns re-extraction and clearing the dirty flag.
#[derive(Debug)]
pub struct ScoreboardWorker {
    pub url: String,
    pub cache: Arc<Mutex<StateCache>>,
    pub events: mpsc::Sender<FeedEvent>,
}

impl ScoreboardWorker {
    pub async fn run(self) {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    let _ = self.events.send(FeedEvent::Connected).await;
                    let (mut write, mut read) = stream.split();

                    if let Err(e) = register(&mut write).await {
                        let _ = self
                            .events
                            .send(FeedEvent::Error(format!("feed register failed: {e}")))
                            .await;
                    } else {
                        while let Some(inbound) = read.next().await {
                            match inbound {
                                Ok(Message::Text(text)) => {
                                    if let Err(e) = self.apply_message(&text).await {
                                        let _ = self
                                            .events
                                            .send(FeedEvent::Error(format!(
                                                "feed parse error: {e}"
                                            )))
                                            .await;
                                    }
                                }
                                Ok(Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    let _ = self
                                        .events
                                        .send(FeedEvent::Error(format!("feed read failed: {e}")))
                                        .await;
                                    break;
                                }
                            }
                        }
                    }
                    let _ = self.events.send(FeedEvent::Disconnected).await;
                }
                Err(e) => {
                    let _ = self
                        .events
                        .send(FeedEvent::Error(format!("feed connect failed: {e}")))
                        .await;
                    let _ = self.events.send(FeedEvent::Disconnected).await;
                }
            }

            if self.events.is_closed() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn apply_message(&self, text: &str) -> Result<(), serde_json::Error> {
        let doc: serde_json::Value = serde_json::from_str(text)?;
        let Some(delta) = doc.get("state").and_then(serde_json::Value::as_object) else {
            // Pings and other non-state messages are fine to ignore.
            return Ok(());
        };
        let newly_dirty = {
            let mut cache = self.cache.lock().await;
            let was_dirty = cache.is_dirty();
            cache.apply_delta(delta);
            cache.is_dirty() && !was_dirty
        };
        if newly_dirty {
            let _ = self.events.send(FeedEvent::StateChanged).await;
        }
        Ok(())
    }
}

async fn register<S>(write: &mut S) -> Result<(), String>
where
    S: futures_util::sink::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let payload = json!({
        "action": "Register",
        "paths": ["ScoreBoard.Version(release)", "ScoreBoard.CurrentGame"],
    });
    let text = serde_json::to_string(&payload).map_err(|e| e.to_string())?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}
