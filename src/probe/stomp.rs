// src/probe/stomp.rs
//! Just enough STOMP 1.2 to log in and read the broker's answer.

use super::ProbeError;
use crate::registry::StompLogin;

/// Login frame. CONNECT-family frames carry header values unescaped.
pub(crate) fn connect_frame(vhost: &str, login: &StompLogin) -> String {
    let mut frame = format!("STOMP\naccept-version:1.2\nhost:{}\n", single_line(vhost));
    if let Some(user) = &login.login {
        frame.push_str(&format!("login:{}\n", single_line(user)));
    }
    if let Some(passcode) = &login.passcode {
        frame.push_str(&format!("passcode:{}\n", single_line(passcode)));
    }
    frame.push_str("\n\0");
    frame
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], "")
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame<'a> {
    pub command: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> Frame<'a> {
    /// Command line and headers; the body is ignored.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let text = text.trim_start_matches(['\r', '\n']);
        let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

        let command = lines.next().filter(|c| !c.is_empty())?;
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() || line.starts_with('\0') {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name, value));
        }

        Some(Self { command, headers })
    }

    /// First occurrence wins, as STOMP requires for repeated headers.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }
}

/// The broker must answer a login with CONNECTED; ERROR or anything else is a
/// protocol failure.
pub(crate) fn expect_connected(raw: &[u8]) -> Result<(), ProbeError> {
    let frame = Frame::parse(raw)
        .ok_or_else(|| ProbeError::Protocol("malformed STOMP frame".into()))?;

    match frame.command {
        "CONNECTED" => Ok(()),
        "ERROR" => Err(ProbeError::Protocol(format!(
            "STOMP login refused: {}",
            frame.header("message").unwrap_or("no reason given")
        ))),
        other => Err(ProbeError::Protocol(format!(
            "expected CONNECTED, got {}",
            other
        ))),
    }
}
