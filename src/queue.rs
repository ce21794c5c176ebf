//! Component F: job intake and result emission over two Redis streams
//! (spec.md §4.F). Grounded on the `process()`/crash-recovery driver
//! loop at the bottom of `simulator/entry.py`.

use crate::config::GlobalConfig;
use crate::orchestrator::{FightRequest, FightResult};
use crate::termination::FinalState;
use anyhow::{Context, anyhow};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{Commands, Connection, Value};
use serde_json::Value as Json;
use std::path::PathBuf;

/// One pulled request together with the stream entry id it must be
/// acked with once processed.
pub struct Delivery {
    pub entry_id: String,
    pub request: FightRequest,
}

pub struct QueueClient {
    conn: Connection,
    request_stream: String,
    group: String,
    result_stream: String,
    consumer: String,
}

impl QueueClient {
    pub fn connect(cfg: &GlobalConfig, worker_name: &str) -> anyhow::Result<QueueClient> {
        let client = redis::Client::open(cfg.redis_url.as_str()).context("invalid redis url")?;
        let conn = client.get_connection().context("failed to connect to redis")?;
        Ok(QueueClient {
            conn,
            request_stream: cfg.simulator_stream.clone(),
            group: cfg.simulator_group.clone(),
            result_stream: cfg.result_stream.clone(),
            consumer: worker_name.to_string(),
        })
    }

    /// First-at-startup crash recovery: claim every message already
    /// delivered to this consumer name but never acked (spec.md §4.F
    /// step 1). Reading with `'0'` as the id, rather than `'>'`,
    /// returns the consumer's own pending entries instead of new ones.
    pub fn claim_unacked(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let opts = StreamReadOptions::default().group(&self.group, &self.consumer);
        let reply: StreamReadReply =
            self.conn.xread_options(&[&self.request_stream], &["0"], &opts).context("xreadgroup('0') failed")?;
        self.deliveries_from_reply(reply)
    }

    /// Block for exactly one new request (spec.md §4.F step 2).
    pub fn next_request(&mut self) -> anyhow::Result<Delivery> {
        let opts = StreamReadOptions::default().group(&self.group, &self.consumer).block(0).count(1);
        let reply: StreamReadReply =
            self.conn.xread_options(&[&self.request_stream], &[">"], &opts).context("xreadgroup('>') failed")?;
        let mut deliveries = self.deliveries_from_reply(reply)?;
        deliveries.pop().ok_or_else(|| anyhow!("blocking xreadgroup returned no message"))
    }

    fn deliveries_from_reply(&self, reply: StreamReadReply) -> anyhow::Result<Vec<Delivery>> {
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                out.push(self.parse_entry(id)?);
            }
        }
        Ok(out)
    }

    fn parse_entry(&self, entry: StreamId) -> anyhow::Result<Delivery> {
        let raw = entry.map.get("data").ok_or_else(|| anyhow!("stream entry {} missing 'data' field", entry.id))?;
        let text = match raw {
            Value::BulkString(bytes) => String::from_utf8(bytes.clone()).context("non-UTF-8 'data' field")?,
            Value::SimpleString(s) => s.clone(),
            other => return Err(anyhow!("unexpected redis value type for 'data': {other:?}")),
        };
        let data: Json = serde_json::from_str(&text).context("malformed request JSON")?;

        let fight_id = data.get("fight_id").cloned().ok_or_else(|| anyhow!("request missing fight_id"))?;
        let game_name = data
            .get("game")
            .and_then(Json::as_str)
            .ok_or_else(|| anyhow!("request missing 'game'"))?
            .to_string();
        let game_settings = data.get("game_settings").cloned().unwrap_or(Json::Null);
        let code_paths: Vec<PathBuf> = data
            .get("codes_filenames")
            .and_then(Json::as_array)
            .ok_or_else(|| anyhow!("request missing 'codes_filenames'"))?
            .iter()
            .map(|v| PathBuf::from(v.as_str().unwrap_or_default()))
            .collect();

        Ok(Delivery { entry_id: entry.id, request: FightRequest { fight_id, game_name, game_settings, code_paths } })
    }

    /// Publish the result record then ack the request (spec.md §4.F
    /// steps 4-5). Exactly-once is not promised: a crash between the
    /// two leaves the request unacked, to be replayed by
    /// `claim_unacked` on the next worker start.
    pub fn publish_result(&mut self, delivery: &Delivery, result: &FightResult) -> anyhow::Result<()> {
        let final_states: Vec<Json> = result.final_states.iter().map(final_state_json).collect();
        let payload = serde_json::json!({
            "fight_id": delivery.request.fight_id,
            "report": result.report,
            "final_states": final_states,
        });
        let data = serde_json::to_string(&payload)?;

        let _: String = self.conn.xadd(&self.result_stream, "*", &[("data", data)]).context("xadd result failed")?;
        let _: i64 = self
            .conn
            .xack(&self.request_stream, &self.group, &[&delivery.entry_id])
            .context("xack failed")?;
        Ok(())
    }
}

fn final_state_json(state: &FinalState) -> Json {
    serde_json::to_value(state).expect("FinalState always serializes")
}
