//! Subprocess broker shim.
//!
//! Each broker entry in the config declares an external command
//! line; the child presents a concrete exchange behind the uniform
//! `StockApi` surface. Framing is one JSON object per line on the
//! child's stdin/stdout: a request `{"method": ..., "params": ...}`
//! answered by `{"ok": ...}` or `{"err": ...}`. The wire protocol is
//! a private detail of this shim.

use crate::api::{ExchangeError, Result, StockApi};
use pmm_core::{MarketInfo, Order, Price, Size, Ticker, Trade};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

pub struct ProcBroker {
    name: String,
    cmdline: String,
    child: Option<Running>,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcBroker {
    /// The child is not spawned until the first call.
    pub fn new(name: impl Into<String>, cmdline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmdline: cmdline.into(),
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn(&mut self) -> Result<&mut Running> {
        if self.child.is_none() {
            let mut parts = self.cmdline.split_whitespace();
            let program = parts.next().ok_or_else(|| {
                ExchangeError::Protocol(format!("broker {}: empty command line", self.name))
            })?;
            debug!(broker = %self.name, cmdline = %self.cmdline, "spawning broker process");
            let mut child = Command::new(program)
                .args(parts)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()?;
            let stdin = child.stdin.take().ok_or_else(|| {
                ExchangeError::Protocol(format!("broker {}: no stdin", self.name))
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                ExchangeError::Protocol(format!("broker {}: no stdout", self.name))
            })?;
            self.child = Some(Running {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            });
        }
        Ok(self.child.as_mut().expect("just spawned"))
    }

    fn call<P: Serialize, R: DeserializeOwned>(&mut self, method: &str, params: P) -> Result<R> {
        let name = self.name.clone();
        let run = self.spawn()?;
        let request = serde_json::to_string(&json!({"method": method, "params": params}))
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
        let io_result = (|| -> std::io::Result<String> {
            writeln!(run.stdin, "{}", request)?;
            run.stdin.flush()?;
            let mut line = String::new();
            run.stdout.read_line(&mut line)?;
            Ok(line)
        })();
        let line = match io_result {
            Ok(line) if !line.is_empty() => line,
            other => {
                // Broken pipe or EOF: the child is gone. Drop it so the
                // next call respawns.
                if let Some(mut running) = self.child.take() {
                    let _ = running.child.kill();
                    let _ = running.child.wait();
                }
                let detail = match other {
                    Ok(_) => "unexpected EOF".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!(broker = %name, error = %detail, "broker process failed");
                return Err(ExchangeError::Transient(format!(
                    "broker {name}: {detail}"
                )));
            }
        };
        let value: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| ExchangeError::Protocol(format!("broker {name}: {e}")))?;
        if let Some(err) = value.get("err") {
            return Err(ExchangeError::Transient(format!("broker {name}: {err}")));
        }
        let ok = value
            .get("ok")
            .cloned()
            .ok_or_else(|| ExchangeError::Protocol(format!("broker {name}: missing ok field")))?;
        serde_json::from_value(ok).map_err(|e| ExchangeError::Protocol(format!("broker {name}: {e}")))
    }
}

impl Drop for ProcBroker {
    fn drop(&mut self) {
        if let Some(mut running) = self.child.take() {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

impl StockApi for ProcBroker {
    fn market_info(&mut self, pair: &str) -> Result<MarketInfo> {
        self.call("market_info", json!({"pair": pair}))
    }

    fn ticker(&mut self, pair: &str) -> Result<Ticker> {
        self.call("ticker", json!({"pair": pair}))
    }

    fn balance(&mut self, symbol: &str) -> Result<Decimal> {
        self.call("balance", json!({"symbol": symbol}))
    }

    fn open_orders(&mut self, pair: &str) -> Result<Vec<Order>> {
        self.call("open_orders", json!({"pair": pair}))
    }

    fn trades(&mut self, last_seen_id: u64, from_time_ms: i64, pair: &str) -> Result<Vec<Trade>> {
        self.call(
            "trades",
            json!({"last_seen_id": last_seen_id, "from_time_ms": from_time_ms, "pair": pair}),
        )
    }

    fn place_order(
        &mut self,
        pair: &str,
        size: Size,
        price: Price,
        client_id: Option<&str>,
        replace_id: Option<u64>,
        replace_size: Size,
    ) -> Result<Option<u64>> {
        self.call(
            "place_order",
            json!({
                "pair": pair,
                "size": size,
                "price": price,
                "client_id": client_id,
                "replace_id": replace_id,
                "replace_size": replace_size,
            }),
        )
    }

    fn fees(&mut self, pair: &str) -> Result<Decimal> {
        self.call("fees", json!({"pair": pair}))
    }

    fn all_pairs(&mut self) -> Result<Vec<String>> {
        self.call("all_pairs", json!({}))
    }

    fn reset(&mut self) -> Result<bool> {
        // A broker that has never been spawned has nothing to reset.
        if self.child.is_none() {
            return Ok(true);
        }
        self.call("reset", json!({}))
    }

    fn is_test(&self) -> bool {
        false
    }
}
