//! Minimal IPMI v2.0 "lanplus" client: just enough RMCP+ to read the chassis
//! power state and send power up.

mod crypto;
mod packet;
mod session;
mod transport;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;

use crate::config::BmcConfig;
use crate::error::ControllerError;
use crate::power::{Controller, ControllerSession};

use session::IpmiSession;
use transport::UdpTransport;

pub const DEFAULT_PORT: u16 = 623;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    Callback,
    User,
    #[default]
    Operator,
    Administrator,
}

impl PrivilegeLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            PrivilegeLevel::Callback => 0x01,
            PrivilegeLevel::User => 0x02,
            PrivilegeLevel::Operator => 0x03,
            PrivilegeLevel::Administrator => 0x04,
        }
    }
}

/// Opens one authenticated RMCP+ session per [`Controller::connect`].
pub struct IpmiController {
    host: String,
    port: u16,
    username: String,
    password: String,
    privilege: PrivilegeLevel,
}

impl IpmiController {
    pub fn new(cfg: &BmcConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            privilege: cfg.privilege,
        }
    }
}

#[async_trait]
impl Controller for IpmiController {
    async fn connect(&self) -> Result<Box<dyn ControllerSession>, ControllerError> {
        let transport = UdpTransport::connect(&self.host, self.port).await?;
        let session = IpmiSession::open(
            transport,
            self.username.as_bytes(),
            self.password.as_bytes(),
            self.privilege,
        ).await?;
        log::debug!("[ipmi] connected to BMC at {}:{}", self.host, self.port);
        Ok(Box::new(session))
    }
}
