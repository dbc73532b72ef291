//! Best-effort durable history. Records are queued fire-and-forget and
//! drained by a worker; a failed write is logged and dropped so gameplay
//! never blocks on persistence.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use veilmatch_types::Identity;

/// Final outcome of one match, recorded after settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRecord {
    pub game_id: String,
    pub players: Vec<Identity>,
    pub winners: Vec<Identity>,
    pub total_pot: u64,
    pub rounds: u64,
}

pub trait HistorySink: Send + Sync + 'static {
    fn record(&self, record: MatchRecord) -> impl Future<Output = Result<(), String>> + Send;
}

pub fn spawn_history_worker<S: HistorySink>(
    sink: S,
    mut records: mpsc::UnboundedReceiver<MatchRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            let game_id = record.game_id.clone();
            if let Err(err) = sink.record(record).await {
                warn!(game_id = %game_id, err = %err, "history write failed; record dropped");
            }
        }
    })
}

/// Sink that logs records and keeps nothing. The default when no store is
/// configured.
#[derive(Clone, Default)]
pub struct LogHistorySink;

impl HistorySink for LogHistorySink {
    fn record(&self, record: MatchRecord) -> impl Future<Output = Result<(), String>> + Send {
        async move {
            debug!(
                game_id = %record.game_id,
                players = record.players.len(),
                pot = record.total_pot,
                rounds = record.rounds,
                "match recorded"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_worker_drains() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_history_worker(LogHistorySink, rx);
        tx.send(MatchRecord {
            game_id: "room-1".to_string(),
            players: vec![],
            winners: vec![],
            total_pot: 100,
            rounds: 3,
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
