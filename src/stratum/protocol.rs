/// Stratum V1 protocol envelope and line framing
///
/// Wire form is one JSON object per newline-terminated line. A frame with
/// both id and method is a request, without an id a notification, and with
/// an id but no method a response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_SUBMIT: &str = "mining.submit";
pub const METHOD_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const METHOD_NOTIFY: &str = "mining.notify";

/// Upper bound on a single JSON-line frame, either direction.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.id.is_some() && !self.method.is_empty()
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_empty() && (self.result.is_some() || self.error.is_some())
    }

    pub fn request(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn subscribe(user_agent: &str) -> Self {
        Self::request(METHOD_SUBSCRIBE, json!([user_agent]))
    }

    pub fn authorize(user: &str, pass: &str) -> Self {
        Self::request(METHOD_AUTHORIZE, json!([user, pass]))
    }

    pub fn set_difficulty(difficulty: f64) -> Self {
        Self::request(METHOD_SET_DIFFICULTY, json!([difficulty]))
    }

    pub fn ok_response(id: Option<i64>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn err_response(id: Option<i64>, code: i64, message: &str) -> Self {
        Self {
            id,
            error: Some(json!([code, message, Value::Null])),
            ..Default::default()
        }
    }

    /// Serialize to a single wire line (no trailing newline).
    pub fn to_line(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Newline-delimited frame reader with a hard per-frame byte cap.
///
/// An oversize frame is consumed through its terminating newline so the
/// stream stays aligned, and reported as `FrameError::TooLarge`.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_frame: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_frame,
            buf: Vec::new(),
        }
    }

    /// Read the next frame. `Ok(None)` means clean EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>, FrameError> {
        self.buf.clear();
        let mut oversize = false;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // EOF: a dangling partial line is delivered as-is
                if self.buf.is_empty() || oversize {
                    return if oversize {
                        Err(FrameError::TooLarge(self.max_frame))
                    } else {
                        Ok(None)
                    };
                }
                return Ok(Some(take_line(&mut self.buf)));
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if !oversize {
                        self.buf.extend_from_slice(&available[..pos]);
                    }
                    self.inner.consume(pos + 1);
                    if oversize || self.buf.len() > self.max_frame {
                        return Err(FrameError::TooLarge(self.max_frame));
                    }
                    return Ok(Some(take_line(&mut self.buf)));
                }
                None => {
                    let len = available.len();
                    if !oversize {
                        self.buf.extend_from_slice(available);
                        if self.buf.len() > self.max_frame {
                            oversize = true;
                            self.buf.clear();
                        }
                    }
                    self.inner.consume(len);
                }
            }
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8_lossy(buf).into_owned()
}

/// Extranonce pair parsed out of an upstream `mining.subscribe` response.
///
/// Pools answer with either the classic array form
/// `[subscriptions, extranonce1, extranonce2_size]` or an object carrying
/// `extranonce1` / `extranonce2_size` members. Anything else is rejected.
pub fn parse_extranonce_result(result: &Value) -> Option<(String, usize)> {
    let (e1, size) = match result {
        Value::Array(arr) => {
            if arr.len() < 3 {
                return None;
            }
            (arr[1].as_str()?.to_string(), parse_extranonce_size(&arr[2])?)
        }
        Value::Object(map) => (
            map.get("extranonce1")?.as_str()?.to_string(),
            parse_extranonce_size(map.get("extranonce2_size")?)?,
        ),
        _ => return None,
    };
    if e1.is_empty() || size == 0 {
        return None;
    }
    Some((e1, size))
}

/// Extranonce2 size arrives as a JSON number from most pools, but a few
/// serialize it as a decimal string.
pub fn parse_extranonce_size(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => {
            let n = n.as_i64()?;
            (n > 0).then_some(n as usize)
        }
        Value::String(s) => {
            let n: i64 = s.parse().ok()?;
            (n > 0).then_some(n as usize)
        }
        _ => None,
    }
}

/// Convert compact nBits (as found in `mining.notify` params[6]) to a
/// decimal difficulty relative to difficulty-1 (0x1d00ffff).
pub fn diff_from_bits(bits: &str) -> f64 {
    let bits = bits.trim_start_matches("0x").trim_start_matches("0X");
    if bits.is_empty() {
        return 0.0;
    }
    let val = match u32::from_str_radix(bits, 16) {
        Ok(v) => v,
        Err(_) => return 0.0,
    };
    let exponent = (val >> 24) as i32;
    let mantissa = (val & 0x00ff_ffff) as f64;
    if mantissa == 0.0 || exponent <= 3 {
        return 0.0;
    }
    // difficulty = diff1_target / target
    //   target      = mantissa * 2^(8*(exponent-3))
    //   diff1_target = 0xffff * 2^(8*(0x1d-3))
    (65535.0 / mantissa) * 2f64.powi(8 * (0x1d - exponent))
}

/// Compact duration for share log lines; "-" when there is nothing to show.
pub fn fmt_duration(d: Duration) -> String {
    if d.is_zero() {
        return "-".to_string();
    }
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        let secs = ms as f64 / 1000.0;
        if (secs - secs.trunc()).abs() < 0.05 {
            format!("{}s", secs.trunc() as u64)
        } else {
            format!("{:.1}s", secs)
        }
    } else {
        let total = ms / 1000;
        format!("{}m{}s", total / 60, total % 60)
    }
}
