//! GSM modem transport
//!
//! Drives a text-mode AT-command session over a serial port to send SMS.
//! Every step has its own timeout; a step that times out or gets an unexpected
//! answer yields `false` together with whatever was received, so callers can
//! log the raw modem output. Nothing here retries a failed send.

use crate::error::ModemError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const CPIN_ATTEMPTS: usize = 5;
const CPIN_TIMEOUT: Duration = Duration::from_secs(6);
const CPIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const CFUN_TIMEOUT: Duration = Duration::from_secs(10);
const COPS_TIMEOUT: Duration = Duration::from_secs(20);
const CREG_TIMEOUT: Duration = Duration::from_secs(8);
const CREG_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Registration time after which the radio is power-cycled once
const RADIO_CYCLE_AFTER: Duration = Duration::from_secs(45);
const RADIO_OFF_SETTLE: Duration = Duration::from_secs(3);
const RADIO_ON_SETTLE: Duration = Duration::from_secs(10);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);
const CTRL_Z: u8 = 0x1A;

/// Serial modem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Open the modem at startup; when false SMS delivery is disabled
    pub enabled: bool,
    /// Serial port path (e.g., "/dev/ttyS0")
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound for network registration polling
    pub registration_timeout_secs: u64,
    /// Settle time after opening the port before the first command
    pub warmup_secs: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            registration_timeout_secs: 120,
            warmup_secs: 20,
        }
    }
}

/// Outcome of a single AT exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtReply {
    pub ok: bool,
    /// Everything received while waiting
    pub raw: String,
}

impl AtReply {
    fn failed(raw: impl Into<String>) -> Self {
        Self {
            ok: false,
            raw: raw.into(),
        }
    }
}

/// Readiness of the modem for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    Ready,
    NoSim,
    SimNotReady,
    RegistrationDenied,
    /// Registration ceiling reached without a home/roaming registration
    Searching,
    PortClosed,
}

impl fmt::Display for ModemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModemStatus::Ready => "Ready",
            ModemStatus::NoSim => "No SIM",
            ModemStatus::SimNotReady => "SIM not ready",
            ModemStatus::RegistrationDenied => "Registration denied",
            ModemStatus::Searching => "Searching",
            ModemStatus::PortClosed => "Serial port not open",
        })
    }
}

/// Something that can deliver one SMS to one number
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Returns `true` only when the carrier accepted the message
    async fn send(&self, number: &str, body: &str) -> bool;
}

/// Extract the registration status from a `+CREG?` response
///
/// `+CREG: <n>,<stat>` yields `stat`; the unsolicited `+CREG: <stat>` form
/// carries no second field and yields `None`.
pub fn parse_creg_status(response: &str) -> Option<u8> {
    let (_, tail) = response.split_once("+CREG:")?;
    let field = tail.split(',').nth(1)?.trim_start();
    let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// One exclusive AT conversation over a borrowed port
struct AtSession<'a, S> {
    port: &'a mut S,
}

impl<'a, S> AtSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Discard input that arrived before the next command
    async fn drain(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match timeout(Duration::ZERO, self.port.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    debug!("Discarded {} stale bytes", n);
                },
                _ => break,
            }
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.port.write_all(data).await?;
        self.port.flush().await
    }

    /// Accumulate input until `done` accepts it or `limit` elapses
    async fn read_until<F>(&mut self, limit: Duration, done: F) -> AtReply
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + limit;
        let mut raw = String::new();
        let mut buf = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AtReply::failed(raw);
            }
            match timeout(remaining, self.port.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    warn!("Modem port closed while waiting for response");
                    return AtReply::failed(raw);
                },
                Ok(Ok(n)) => {
                    raw.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if done(&raw) {
                        return AtReply { ok: true, raw };
                    }
                    if raw.contains("ERROR") {
                        return AtReply::failed(raw);
                    }
                },
                Ok(Err(e)) => {
                    warn!("Modem read error: {}", e);
                    return AtReply::failed(raw);
                },
                Err(_) => return AtReply::failed(raw),
            }
        }
    }

    /// Send `cmd` and wait for `expect` to appear in the response
    async fn command(&mut self, cmd: &str, expect: &str, limit: Duration) -> AtReply {
        self.drain().await;
        if let Err(e) = self.write_raw(format!("{}\r\n", cmd).as_bytes()).await {
            warn!("Failed to write {}: {}", cmd, e);
            return AtReply::failed(String::new());
        }
        let reply = self.read_until(limit, |raw| raw.contains(expect)).await;
        if !reply.ok {
            debug!(command = cmd, response = %reply.raw.trim(), "AT command did not succeed");
        }
        reply
    }

    async fn ok(&mut self, cmd: &str, limit: Duration) -> AtReply {
        self.command(cmd, "OK", limit).await
    }

    async fn check_sim(&mut self) -> Result<(), ModemStatus> {
        let mut last = String::new();
        for attempt in 1..=CPIN_ATTEMPTS {
            let reply = self.command("AT+CPIN?", "+CPIN: READY", CPIN_TIMEOUT).await;
            if reply.ok {
                return Ok(());
            }
            debug!("SIM not ready (attempt {}/{})", attempt, CPIN_ATTEMPTS);
            last = reply.raw;
            sleep(CPIN_RETRY_DELAY).await;
        }
        if last.contains("SIM NOT INSERTED") || last.contains("SIM not inserted") {
            Err(ModemStatus::NoSim)
        } else {
            Err(ModemStatus::SimNotReady)
        }
    }

    async fn cycle_radio(&mut self) {
        info!("Modem not registered yet, cycling radio");
        self.ok("AT+CFUN=0", CFUN_TIMEOUT).await;
        sleep(RADIO_OFF_SETTLE).await;
        self.ok("AT+CFUN=1", CFUN_TIMEOUT).await;
        sleep(RADIO_ON_SETTLE).await;
    }

    async fn wait_registration(&mut self, ceiling: Duration) -> ModemStatus {
        let start = Instant::now();
        let mut radio_cycled = false;

        while start.elapsed() < ceiling {
            let reply = self.ok("AT+CREG?", CREG_TIMEOUT).await;
            if reply.ok {
                match parse_creg_status(&reply.raw) {
                    Some(1) | Some(5) => return ModemStatus::Ready,
                    Some(3) => return ModemStatus::RegistrationDenied,
                    Some(stat) => debug!("Registration status {}", stat),
                    None => {},
                }
            }
            sleep(CREG_POLL_INTERVAL).await;

            if !radio_cycled && start.elapsed() > RADIO_CYCLE_AFTER {
                self.cycle_radio().await;
                radio_cycled = true;
            }
        }
        ModemStatus::Searching
    }

    /// SIM, functionality and network registration checks
    async fn ensure_ready(&mut self, ceiling: Duration) -> ModemStatus {
        self.ok("ATE0", DEFAULT_TIMEOUT).await;
        self.ok("AT+CMEE=2", DEFAULT_TIMEOUT).await;

        if let Err(status) = self.check_sim().await {
            return status;
        }

        let cfun = self.ok("AT+CFUN?", DEFAULT_TIMEOUT).await;
        if cfun.ok && !cfun.raw.contains("+CFUN: 1") {
            self.ok("AT+CFUN=1", CFUN_TIMEOUT).await;
        }
        self.ok("AT+COPS=0", COPS_TIMEOUT).await;

        self.wait_registration(ceiling).await
    }

    /// Wait for the `>` prompt, reading one byte at a time
    async fn wait_prompt(&mut self) -> bool {
        let read_prompt = async {
            loop {
                match self.port.read_u8().await {
                    Ok(b'>') => return true,
                    Ok(_) => {},
                    Err(_) => return false,
                }
            }
        };
        timeout(PROMPT_TIMEOUT, read_prompt).await.unwrap_or(false)
    }

    async fn submit_text(&mut self, number: &str, body: &str) -> AtReply {
        let mode = self.ok("AT+CMGF=1", DEFAULT_TIMEOUT).await;
        if !mode.ok {
            return mode;
        }

        self.drain().await;
        let header = format!("AT+CMGS=\"{}\"\r\n", number);
        if let Err(e) = self.write_raw(header.as_bytes()).await {
            return AtReply::failed(e.to_string());
        }
        if !self.wait_prompt().await {
            return AtReply::failed("no '>' prompt");
        }

        let mut payload = body.as_bytes().to_vec();
        payload.push(CTRL_Z);
        if let Err(e) = self.write_raw(&payload).await {
            return AtReply::failed(e.to_string());
        }

        self.read_until(SUBMIT_TIMEOUT, |raw| {
            raw.contains("+CMGS:") && raw.contains("OK")
        })
        .await
    }
}

/// AT-command SMS transport
///
/// Owns the port exclusively; all exchanges are serialized by an async
/// mutex, so one send (with its readiness checks) runs at a time.
pub struct ModemTransport<S = SerialStream> {
    port: Mutex<Option<S>>,
    registration_ceiling: Duration,
}

impl ModemTransport<SerialStream> {
    /// Open the configured serial port and let the module settle
    pub async fn open(config: &ModemConfig) -> Result<Self, ModemError> {
        debug!("Opening serial port: {}", config.port);
        let port = tokio_serial::new(&config.port, config.baud_rate)
            .timeout(Duration::from_secs(1))
            .open_native_async()
            .map_err(|e| ModemError::Open {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;
        info!("Serial port {} opened at {} baud", config.port, config.baud_rate);

        if config.warmup_secs > 0 {
            info!("Waiting {}s for modem warm-up", config.warmup_secs);
            sleep(Duration::from_secs(config.warmup_secs)).await;
        }

        Ok(Self::new(
            port,
            Duration::from_secs(config.registration_timeout_secs),
        ))
    }
}

impl<S> ModemTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already open stream
    pub fn new(port: S, registration_ceiling: Duration) -> Self {
        Self {
            port: Mutex::new(Some(port)),
            registration_ceiling,
        }
    }

    /// Send one AT command and wait for `expect`
    pub async fn command(&self, cmd: &str, expect: &str, limit: Duration) -> AtReply {
        let mut guard = self.port.lock().await;
        match guard.as_mut() {
            Some(port) => AtSession { port }.command(cmd, expect, limit).await,
            None => AtReply::failed(ModemStatus::PortClosed.to_string()),
        }
    }

    /// Run the SIM, functionality and registration checks
    pub async fn ensure_ready(&self) -> ModemStatus {
        let mut guard = self.port.lock().await;
        match guard.as_mut() {
            Some(port) => {
                AtSession { port }
                    .ensure_ready(self.registration_ceiling)
                    .await
            },
            None => ModemStatus::PortClosed,
        }
    }

    /// Check readiness, then submit one text message
    pub async fn send_sms(&self, number: &str, body: &str) -> bool {
        let mut guard = self.port.lock().await;
        let Some(port) = guard.as_mut() else {
            warn!("SMS to {} skipped: serial port not open", number);
            return false;
        };
        let mut session = AtSession { port };

        let status = session.ensure_ready(self.registration_ceiling).await;
        if status != ModemStatus::Ready {
            warn!("SMS to {} not sent: modem {}", number, status);
            return false;
        }

        let reply = session.submit_text(number, body).await;
        if reply.ok {
            info!("SMS sent to {}", number);
        } else {
            warn!(response = %reply.raw.trim(), "SMS to {} failed", number);
        }
        reply.ok
    }

    /// Release the port; later calls fail with `PortClosed`
    pub async fn close(&self) {
        if self.port.lock().await.take().is_some() {
            info!("Modem port closed");
        }
    }
}

#[async_trait]
impl<S> SmsSender for ModemTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, number: &str, body: &str) -> bool {
        self.send_sms(number, body).await
    }
}
