//! # Simulated AT Modem
//!
//! A byte-level modem on one end of an in-memory duplex pipe. The host end
//! goes to [`tether_core::at::AtPort`], so the whole line protocol is
//! exercised: echo, information lines, final result codes, unsolicited
//! lines interleaved with responses, late replies and unplugging.
//!
//! The command set is a small Huawei-flavoured 3GPP dialect: identification,
//! `+CSQ`, `^HCSQ?`, `+WS46?`, `^SYSCFGEX?`, `+CGDCONT`/`+CGAUTH`/`+CGACT`,
//! `^NDISDUP`/`^NDISSTATQRY?` and `^WPDGP`/`^WPEND`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What the simulated modem reports.
#[derive(Debug, Clone)]
pub struct ModemProfile {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    /// `+CSQ` rssi index and ber.
    pub csq: (u32, u32),
    /// `+WS46` value, `None` answers `ERROR`.
    pub ws46: Option<u32>,
    /// `^SYSCFGEX` acquisition order, `None` answers `ERROR`.
    pub syscfgex: Option<String>,
    /// `^HCSQ` value, `None` answers `ERROR`.
    pub hcsq: Option<String>,
    /// Status polls reporting "down" after activation before it comes up.
    pub activation_polls: u32,
    /// Send `^NDISSTAT` after `^NDISDUP`.
    pub ndis_notify: bool,
    pub echo: bool,
    /// Unsolicited lines sent once at power-on.
    pub power_on: Vec<String>,
    /// Per-command answer delay, keyed by the exact command.
    pub delays: HashMap<String, Duration>,
}

impl Default for ModemProfile {
    fn default() -> Self {
        Self {
            manufacturer: "huawei".into(),
            model: "E3372".into(),
            revision: "22.328.62.00.143".into(),
            csq: (20, 99),
            ws46: Some(25),
            syscfgex: Some("030201".into()),
            hcsq: Some("\"LTE\",60,52,131,32".into()),
            activation_polls: 0,
            ndis_notify: true,
            echo: true,
            power_on: Vec::new(),
            delays: HashMap::new(),
        }
    }
}

impl ModemProfile {
    /// A plain 3GPP modem without vendor commands.
    pub fn generic() -> Self {
        Self {
            manufacturer: "Generic".into(),
            model: "LTE Modem".into(),
            revision: "1.0".into(),
            syscfgex: None,
            hcsq: None,
            ndis_notify: false,
            ..Self::default()
        }
    }

    /// Report home registration on LTE at power-on.
    pub fn registered(mut self) -> Self {
        self.power_on.push("+CEREG: 1,\"00A1\",\"0001F2C3\",7".into());
        self
    }
}

#[derive(Debug, Default)]
struct ModemState {
    contexts: HashMap<u32, String>,
    active: HashMap<u32, bool>,
    polls_left: u32,
    ndis: bool,
    location: bool,
    commands: Vec<String>,
}

/// Control side of a running simulated modem.
#[derive(Clone)]
pub struct SimModem {
    state: Arc<Mutex<ModemState>>,
    urcs: mpsc::UnboundedSender<String>,
    unplug: CancellationToken,
}

fn lock(m: &Mutex<ModemState>) -> MutexGuard<'_, ModemState> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimModem {
    /// Start the modem. Returns the host end of the pipe and the control
    /// handle.
    pub fn spawn(profile: ModemProfile) -> (DuplexStream, SimModem) {
        let (host, device) = tokio::io::duplex(4096);
        let (urcs, urc_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ModemState::default()));
        let unplug = CancellationToken::new();
        tokio::spawn(run(device, profile, state.clone(), urc_rx, unplug.clone()));
        (host, SimModem { state, urcs, unplug })
    }

    /// Emit an unsolicited line.
    pub fn urc(&self, line: impl Into<String>) {
        let _ = self.urcs.send(line.into());
    }

    /// Close the device end: the host sees EOF.
    pub fn unplug(&self) {
        self.unplug.cancel();
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn is_active(&self, cid: u32) -> bool {
        let s = lock(&self.state);
        s.active.get(&cid).copied().unwrap_or(false) || s.ndis
    }
}

enum Answer {
    Ok(Vec<String>),
    Error,
}

fn ok() -> Answer {
    Answer::Ok(Vec::new())
}

fn lines(v: impl IntoIterator<Item = String>) -> Answer {
    Answer::Ok(v.into_iter().collect())
}

async fn run(
    device: DuplexStream,
    profile: ModemProfile,
    state: Arc<Mutex<ModemState>>,
    mut urc_rx: mpsc::UnboundedReceiver<String>,
    unplug: CancellationToken,
) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let boot: String = profile.power_on.iter().map(|l| format!("\r\n{l}\r\n")).collect();
    if writer.write_all(boot.as_bytes()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = unplug.cancelled() => break,
            Some(line) = urc_rx.recv() => {
                if writer.write_all(format!("\r\n{line}\r\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            read = reader.read_until(b'\r', &mut buf) => {
                // A cancelled read leaves its partial bytes in `buf`.
                let cmd = match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => String::from_utf8_lossy(&buf).trim().to_string(),
                };
                buf.clear();
                if cmd.is_empty() {
                    continue;
                }
                trace!(%cmd, "modem received");
                if let Some(delay) = profile.delays.get(&cmd) {
                    tokio::time::sleep(*delay).await;
                }
                let (answer, unsolicited) = respond(&cmd, &profile, &mut lock(&state));
                let mut out = String::new();
                if profile.echo {
                    out.push_str(&cmd);
                    out.push_str("\r\n");
                }
                match answer {
                    Answer::Ok(info) => {
                        for l in info {
                            out.push_str(&format!("\r\n{l}\r\n"));
                        }
                        out.push_str("\r\nOK\r\n");
                    }
                    Answer::Error => out.push_str("\r\nERROR\r\n"),
                }
                for l in unsolicited {
                    out.push_str(&format!("\r\n{l}\r\n"));
                }
                if writer.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("simulated modem gone");
}

/// Answer one command, plus unsolicited lines to send after it.
fn respond(cmd: &str, p: &ModemProfile, s: &mut ModemState) -> (Answer, Vec<String>) {
    s.commands.push(cmd.to_string());
    let mut after = Vec::new();
    let answer = match cmd {
        "AT" | "ATE0" => ok(),
        "AT+CGMI" | "AT+GMI" => lines([p.manufacturer.clone()]),
        "AT+CGMM" | "AT+GMM" => lines([p.model.clone()]),
        "AT+CGMR" | "AT+GMR" => lines([p.revision.clone()]),
        "AT+CSQ" => lines([format!("+CSQ: {},{}", p.csq.0, p.csq.1)]),
        "AT+WS46?" => match p.ws46 {
            Some(n) => lines([format!("+WS46: {n}")]),
            None => Answer::Error,
        },
        "AT^SYSCFGEX?" => match &p.syscfgex {
            Some(order) => lines([format!("^SYSCFGEX: \"{order}\",3FFFFFFF,1,2,7FFFFFFFFFFFFFFF,,")]),
            None => Answer::Error,
        },
        "AT^HCSQ?" => match &p.hcsq {
            Some(v) => lines([format!("^HCSQ: {v}")]),
            None => Answer::Error,
        },
        "AT+CGACT?" => {
            let ready = s.polls_left == 0;
            s.polls_left = s.polls_left.saturating_sub(1);
            let mut cids: Vec<_> = s.contexts.keys().copied().collect();
            cids.sort();
            lines(cids.into_iter().map(|cid| {
                let up = s.active.get(&cid).copied().unwrap_or(false) && ready;
                format!("+CGACT: {cid},{}", u8::from(up))
            }))
        }
        "AT^NDISSTATQRY?" => lines([format!("^NDISSTATQRY: {},,,\"IPV4\"", u8::from(s.ndis))]),
        "AT^WPDGP" => {
            s.location = true;
            ok()
        }
        "AT^WPEND" => {
            if std::mem::take(&mut s.location) {
                after.push("^POSEND: 0,0".to_string());
            }
            ok()
        }
        _ => set_command(cmd, p, s, &mut after),
    };
    (answer, after)
}

fn args(cmd: &str, prefix: &str) -> Option<Vec<String>> {
    cmd.strip_prefix(prefix)
        .map(|rest| rest.split(',').map(|a| a.trim().trim_matches('"').to_string()).collect())
}

fn set_command(cmd: &str, p: &ModemProfile, s: &mut ModemState, after: &mut Vec<String>) -> Answer {
    if let Some(a) = args(cmd, "AT+CGDCONT=") {
        return match (a.first().and_then(|c| c.parse().ok()), a.get(2)) {
            (Some(cid), Some(apn)) => {
                s.contexts.insert(cid, apn.clone());
                ok()
            }
            _ => Answer::Error,
        };
    }
    if cmd.starts_with("AT+CGAUTH=") {
        return ok();
    }
    if let Some(a) = args(cmd, "AT+CGACT=") {
        let cid: Option<u32> = a.get(1).and_then(|c| c.parse().ok());
        return match (a.first().map(String::as_str), cid) {
            (Some("1"), Some(cid)) if s.contexts.contains_key(&cid) => {
                s.active.insert(cid, true);
                s.polls_left = p.activation_polls;
                ok()
            }
            (Some("0"), Some(cid)) => {
                s.active.insert(cid, false);
                ok()
            }
            _ => Answer::Error,
        };
    }
    if let Some(a) = args(cmd, "AT^NDISDUP=") {
        return match a.get(1).map(String::as_str) {
            Some("1") => {
                s.ndis = true;
                if p.ndis_notify {
                    after.push("^NDISSTAT: 1,,,\"IPV4\"".into());
                }
                ok()
            }
            Some("0") => {
                s.ndis = false;
                ok()
            }
            _ => Answer::Error,
        };
    }
    Answer::Error
}
