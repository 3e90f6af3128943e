use std::{net::SocketAddr, ops::Deref, str::FromStr};

use sarge::{ArgumentType, prelude::*};

sarge! {
    pub Args,

    > "The address the proxy listens on."
    #ok 'l' @FPROXY_BIND pub bind: BindAddr,

    > "Server connect timeout in seconds."
    #ok 't' @FPROXY_TIMEOUT pub timeout: Seconds,

    > "Listen backlog depth."
    #ok @FPROXY_BACKLOG pub backlog: Count,

    > "Maximum number of concurrently served sessions."
    #ok 'w' @FPROXY_WORKERS pub workers: Count,

    > "Upstream proxy as host:port; non-443 traffic is routed through it."
    #ok 'u' @FPROXY_UPSTREAM pub upstream: HostPort,

    > "log level: \"\" means no log, v - info, vv - debug, vvv - trace"
    #ok 'v' @FPROXY_LOG_LEVEL pub log_level: LogLevel,

    > "log with color?"
    #ok pub colored: bool,

    > "help"
    #ok 'h' pub help: bool,
}

#[derive(Debug)]
pub struct LogLevel(String);

impl FromStr for LogLevel {
    type Err = core::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(String::from_str(s)?))
    }
}

impl ArgumentType for LogLevel {
    type Error = ArgParseError;
    fn from_value(val: Option<&str>) -> sarge::ArgResult<Self> {
        const VERBOSE_PAT: char = 'v';

        if let Some(v) = val {
            let level_str = match v.trim().to_ascii_lowercase().as_str() {
                "off" => "off",
                "err" | "error" => "error",
                "warn" | "warning" => "warn",
                "info" => "info",
                "debug" => "debug",
                "trace" => "trace",
                s => {
                    let count = s
                        .chars()
                        .filter(|c| c.eq_ignore_ascii_case(&VERBOSE_PAT))
                        .count();
                    match count {
                        0 => "off",
                        1 => "info",
                        2 => "debug",
                        _ => "trace",
                    }
                }
            };

            return Ok(LogLevel(level_str.into())).into();
        }

        Ok(LogLevel("error".into())).into()
    }
}

impl Deref for LogLevel {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct BindAddr(SocketAddr);

impl ArgumentType for BindAddr {
    type Error = ArgParseError;

    fn from_value(val: Option<&str>) -> sarge::ArgResult<Self> {
        if let Some(v) = val {
            let bind_addr = SocketAddr::from_str(v).ok()?;
            return Ok(BindAddr(bind_addr)).into();
        }
        None
    }
}

impl FromStr for BindAddr {
    type Err = std::net::AddrParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(SocketAddr::from_str(s)?))
    }
}

impl Deref for BindAddr {
    type Target = SocketAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Seconds(u64);

impl ArgumentType for Seconds {
    type Error = ArgParseError;

    fn from_value(val: Option<&str>) -> sarge::ArgResult<Self> {
        if let Some(v) = val {
            let secs = u64::from_str(v.trim()).ok()?;
            return Ok(Seconds(secs)).into();
        }
        None
    }
}

impl FromStr for Seconds {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str(s)?))
    }
}

impl Deref for Seconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Count(u64);

impl ArgumentType for Count {
    type Error = ArgParseError;

    fn from_value(val: Option<&str>) -> sarge::ArgResult<Self> {
        if let Some(v) = val {
            let count = u64::from_str(v.trim()).ok()?;
            return Ok(Count(count)).into();
        }
        None
    }
}

impl FromStr for Count {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str(s)?))
    }
}

impl Deref for Count {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// An upstream proxy target, written `host:port`.
#[derive(Debug, Clone)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl ArgumentType for HostPort {
    type Error = ArgParseError;

    fn from_value(val: Option<&str>) -> sarge::ArgResult<Self> {
        if let Some(v) = val {
            let parsed = HostPort::from_str(v).ok()?;
            return Ok(parsed).into();
        }
        None
    }
}

impl FromStr for HostPort {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected host:port, got: {s}"))?;
        if host.is_empty() {
            return Err(anyhow::anyhow!("expected host:port, got: {s}"));
        }
        Ok(Self {
            host: host.to_owned(),
            port: port.parse()?,
        })
    }
}
