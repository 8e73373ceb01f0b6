//! # CLI Execution Functions
//!
//! Thin HTTP clients behind the `device`, `job`, and `model` subcommands.
//! These talk to a running orchestrator over its public API using blocking
//! `ureq` calls — operators script them, nothing here needs an async
//! runtime.

use anyhow::{bail, Context, Result};
use edgeorchestra::model_store::{reassemble, ModelChunkFrame};
use std::path::Path;
use std::time::Duration;

pub struct Client {
    base_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(Duration::from_secs(5)))
                .timeout_send_request(Some(Duration::from_secs(30)))
                .build(),
        );
        Client {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let mut req = self.agent.get(self.url(path));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let mut resp = req.call().with_context(|| format!("GET {}", path))?;
        Ok(resp.body_mut().read_json()?)
    }

    fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut req = self.agent.post(self.url(path));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let mut resp = req
            .send_json(body)
            .with_context(|| format!("POST {}", path))?;
        Ok(resp.body_mut().read_json()?)
    }

    fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut req = self.agent.get(self.url(path));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let mut resp = req.call().with_context(|| format!("GET {}", path))?;
        Ok(resp
            .body_mut()
            .with_config()
            .limit(1024 * 1024 * 1024)
            .read_to_vec()?)
    }

    fn post_bytes(&self, path: &str, body: &[u8]) -> Result<serde_json::Value> {
        let mut req = self
            .agent
            .post(self.url(path))
            .header("content-type", "application/octet-stream");
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let mut resp = req
            .send(body)
            .with_context(|| format!("POST {}", path))?;
        Ok(resp.body_mut().read_json()?)
    }
}

// ── Devices ─────────────────────────────────────────────────────

pub fn run_device_list(client: &Client, status: Option<&str>) -> Result<()> {
    let path = match status {
        Some(s) => format!("/api/devices?status={}", s),
        None => "/api/devices".to_string(),
    };
    let devices = client.get_json(&path)?;
    let list = devices.as_array().context("expected device array")?;
    println!(
        "{:<38} {:<18} {:<10} {:<8} {}",
        "DEVICE", "MODEL", "STATUS", "BATTERY", "LAST SEEN"
    );
    for d in list {
        let battery = d
            .pointer("/last_metrics/battery_level")
            .and_then(|v| v.as_f64())
            .map(|b| format!("{:.0}%", b * 100.0))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<38} {:<18} {:<10} {:<8} {}",
            d["device_id"].as_str().unwrap_or("-"),
            d["device_model"].as_str().unwrap_or("-"),
            d["status"].as_str().unwrap_or("-"),
            battery,
            d["last_seen_at"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn run_device_evict(client: &Client, id: &str) -> Result<()> {
    client.post_json(
        &format!("/api/devices/{}/command", id),
        &serde_json::json!({ "type": "shutdown" }),
    )?;
    client.post_json(&format!("/api/devices/{}/unregister", id), &serde_json::json!({}))?;
    println!("Device {} evicted (shutdown queued, marked offline)", id);
    Ok(())
}

// ── Jobs ────────────────────────────────────────────────────────

pub fn run_job_submit(
    client: &Client,
    architecture: &str,
    model_id: &str,
    rounds: u32,
    quorum: Option<u32>,
    round_timeout_s: Option<u64>,
) -> Result<()> {
    let mut body = serde_json::json!({
        "architecture": architecture,
        "initial_model_id": model_id,
        "target_rounds": rounds,
    });
    if let Some(q) = quorum {
        body["quorum"] = q.into();
    }
    if let Some(t) = round_timeout_s {
        body["round_timeout_s"] = t.into();
    }
    let resp = client.post_json("/api/jobs", &body)?;
    println!("{}", resp["job_id"].as_str().unwrap_or("-"));
    Ok(())
}

pub fn run_job_list(client: &Client) -> Result<()> {
    let jobs = client.get_json("/api/jobs")?;
    let list = jobs.as_array().context("expected job array")?;
    println!(
        "{:<38} {:<16} {:<10} {:<8} {}",
        "JOB", "ARCHITECTURE", "STATUS", "ROUND", "STARTED"
    );
    for j in list {
        println!(
            "{:<38} {:<16} {:<10} {:<8} {}",
            j["job_id"].as_str().unwrap_or("-"),
            j["architecture"].as_str().unwrap_or("-"),
            j["status"].as_str().unwrap_or("-"),
            format!(
                "{}/{}",
                j["current_round"].as_i64().unwrap_or(0),
                j["target_rounds"].as_i64().unwrap_or(0)
            ),
            j["started_at"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn run_job_show(client: &Client, id: &str) -> Result<()> {
    let detail = client.get_json(&format!("/api/jobs/{}", id))?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

pub fn run_job_cancel(client: &Client, id: &str) -> Result<()> {
    client.post_json(&format!("/api/jobs/{}/cancel", id), &serde_json::json!({}))?;
    println!("Job {} cancelled", id);
    Ok(())
}

// ── Models ──────────────────────────────────────────────────────

pub fn run_model_put(client: &Client, file: &Path) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("reading model file {}", file.display()))?;
    let resp = client.post_bytes("/api/models/upload", &bytes)?;
    println!("{}", resp["model_id"].as_str().unwrap_or("-"));
    Ok(())
}

pub fn run_model_stat(client: &Client, id: &str) -> Result<()> {
    let stat = client.get_json(&format!("/api/models/{}", id))?;
    println!("{}", serde_json::to_string_pretty(&stat)?);
    Ok(())
}

pub fn run_model_fetch(client: &Client, id: &str, out: &Path) -> Result<()> {
    let raw = client.get_bytes(&format!("/api/models/{}/download", id))?;
    let frames = split_frames(&raw)?;
    let bytes = reassemble(&frames)?;
    std::fs::write(out, &bytes)
        .with_context(|| format!("writing model to {}", out.display()))?;
    println!("Fetched {} bytes → {}", bytes.len(), out.display());
    Ok(())
}

/// Split a download body into frames: each is a u32-LE length prefix
/// followed by a bincode-encoded [`ModelChunkFrame`].
fn split_frames(raw: &[u8]) -> Result<Vec<ModelChunkFrame>> {
    let mut frames = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        if rest.len() < 4 {
            bail!("truncated frame length prefix");
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            bail!("truncated frame body ({} of {} bytes)", rest.len(), len);
        }
        frames.push(bincode::deserialize(&rest[..len])?);
        rest = &rest[len..];
    }
    Ok(frames)
}
