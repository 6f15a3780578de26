//! Byte-stream boundary between sessions and transports.
//!
//! Sessions only need to write text to a device and read whatever it sent
//! back. Real transports (SSH, Telnet) live outside this crate and plug in
//! through [`Connector`]. [`VirtualDevice`] is an in-memory device used by
//! tests and dry runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use regex::Regex;

use crate::error::FleetError;
use crate::host::Host;

/// An open text stream to a device.
///
/// Implementations enforce their own read timeouts and report them as
/// [`FleetError::ConnectionTimeout`].
pub trait Connection: Send {
    /// Writes raw text to the device.
    fn send(&mut self, data: &str) -> Result<(), FleetError>;

    /// Reads the next chunk of output; `None` means the stream ended.
    fn receive(&mut self) -> Result<Option<String>, FleetError>;

    fn close(&mut self) -> Result<(), FleetError>;

    /// Version-exchange banner of the transport, if it has one.
    fn protocol_banner(&self) -> Option<String> {
        None
    }
}

/// Opens connections to hosts.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, FleetError>;
}

/// How a [`VirtualDevice`] authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginType {
    PasswordOnly,
    UserOnly,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptStage {
    Username,
    Password,
    Command,
}

type CommandHandler = Box<dyn Fn(&str) -> String + Send>;

/// A scripted in-memory device.
///
/// Input is processed line by line. Before login the device walks through
/// its user and password prompts; afterwards every line is answered by the
/// first registered command handler whose pattern matches it, followed by
/// the command prompt. When no output is pending, [`receive`] fails with
/// [`FleetError::ConnectionTimeout`] the way a real transport times out.
///
/// [`receive`]: Connection::receive
pub struct VirtualDevice {
    hostname: String,
    banner: String,
    prompt: String,
    user_prompt: String,
    password_prompt: String,
    echo: bool,
    strict: bool,
    login_type: LoginType,
    credentials: Option<(String, String)>,
    protocol_banner: Option<String>,
    commands: Vec<(Regex, CommandHandler)>,
    chunk_size: Option<usize>,

    stage: PromptStage,
    logged_in: bool,
    entered_user: Option<String>,
    input: String,
    output: VecDeque<String>,
    closed: bool,
}

impl VirtualDevice {
    /// Creates a device that asks for user and password and accepts anything.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let mut device = Self {
            banner: format!("Welcome to {hostname}!\n"),
            prompt: format!("{hostname}> "),
            hostname,
            user_prompt: "User: ".to_string(),
            password_prompt: "Password: ".to_string(),
            echo: true,
            strict: true,
            login_type: LoginType::Both,
            credentials: None,
            protocol_banner: None,
            commands: Vec::new(),
            chunk_size: None,
            stage: PromptStage::Username,
            logged_in: false,
            entered_user: None,
            input: String::new(),
            output: VecDeque::new(),
            closed: false,
        };
        device.init();
        device
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self.init();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self.init();
        self
    }

    pub fn with_login_type(mut self, login_type: LoginType) -> Self {
        self.login_type = login_type;
        self.init();
        self
    }

    /// Only accepts this username and password.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// With `strict` unset, unknown commands are answered with just a prompt.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_protocol_banner(mut self, banner: impl Into<String>) -> Self {
        self.protocol_banner = Some(banner.into());
        self
    }

    /// Delivers output in chunks of at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self.init();
        self
    }

    /// Registers a handler for commands matching `pattern`.
    pub fn add_command<F>(&mut self, pattern: &str, handler: F) -> Result<(), FleetError>
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        let regex = Regex::new(pattern)?;
        self.commands.push((regex, Box::new(handler)));
        Ok(())
    }

    /// Registers a fixed response for commands matching `pattern`.
    pub fn add_response(&mut self, pattern: &str, response: impl Into<String>) -> Result<(), FleetError> {
        let response = response.into();
        self.add_command(pattern, move |_| response.clone())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Resets the login state and queues the banner and first prompt.
    pub fn init(&mut self) {
        self.logged_in = false;
        self.entered_user = None;
        self.input.clear();
        self.output.clear();
        self.stage = match self.login_type {
            LoginType::PasswordOnly => PromptStage::Password,
            LoginType::None => PromptStage::Command,
            LoginType::UserOnly | LoginType::Both => PromptStage::Username,
        };
        let prompt = self.next_prompt();
        let greeting = format!("{}{prompt}", self.banner);
        self.queue(greeting);
    }

    fn next_prompt(&mut self) -> String {
        match self.stage {
            PromptStage::Username => {
                self.stage = if self.login_type == LoginType::UserOnly {
                    PromptStage::Command
                } else {
                    PromptStage::Password
                };
                self.user_prompt.clone()
            }
            PromptStage::Password => {
                self.stage = PromptStage::Command;
                self.password_prompt.clone()
            }
            PromptStage::Command => {
                self.logged_in = true;
                self.prompt.clone()
            }
        }
    }

    fn credentials_accepted(&self, password: Option<&str>) -> bool {
        let Some((user, expected)) = &self.credentials else {
            return true;
        };
        let user_ok = match self.login_type {
            LoginType::PasswordOnly | LoginType::None => true,
            LoginType::UserOnly | LoginType::Both => self.entered_user.as_deref() == Some(user.as_str()),
        };
        let password_ok = match self.login_type {
            LoginType::UserOnly | LoginType::None => true,
            LoginType::PasswordOnly | LoginType::Both => password == Some(expected.as_str()),
        };
        user_ok && password_ok
    }

    /// Answers one line of input.
    fn respond(&mut self, line: &str) -> String {
        if !self.logged_in {
            // The prompt that was just answered is the one before `self.stage`.
            let answered_password = self.stage == PromptStage::Command
                && matches!(self.login_type, LoginType::PasswordOnly | LoginType::Both);
            let echo = if self.echo && !answered_password { line } else { "" };
            if self.stage == PromptStage::Password {
                self.entered_user = Some(line.to_string());
            }
            if self.stage == PromptStage::Command {
                if self.login_type == LoginType::UserOnly {
                    self.entered_user = Some(line.to_string());
                }
                let password = answered_password.then_some(line);
                if !self.credentials_accepted(password) {
                    trace!("{}: login rejected", self.hostname);
                    self.entered_user = None;
                    self.stage = match self.login_type {
                        LoginType::PasswordOnly => PromptStage::Password,
                        _ => PromptStage::Username,
                    };
                    let prompt = self.next_prompt();
                    return format!("{echo}\nLogin failed\n{prompt}");
                }
            }
            let prompt = self.next_prompt();
            return format!("{echo}\n{prompt}");
        }

        let echo = if self.echo { line } else { "" };
        let response = self
            .commands
            .iter()
            .find(|(regex, _)| regex.is_match(line))
            .map(|(_, handler)| handler(line));
        let prompt = self.prompt.clone();
        match response {
            Some(text) if text.is_empty() || text.ends_with('\n') => {
                format!("{echo}\n{text}{prompt}")
            }
            Some(text) => format!("{echo}\n{text}\n{prompt}"),
            None if self.strict && !line.trim().is_empty() => {
                format!("{echo}\n% Invalid input detected\n{prompt}")
            }
            None => format!("{echo}\n{prompt}"),
        }
    }

    fn queue(&mut self, data: String) {
        match self.chunk_size {
            Some(size) => {
                let mut rest = data.as_str();
                while !rest.is_empty() {
                    let mut end = size.min(rest.len());
                    while !rest.is_char_boundary(end) {
                        end += 1;
                    }
                    self.output.push_back(rest[..end].to_string());
                    rest = &rest[end..];
                }
            }
            None => self.output.push_back(data),
        }
    }
}

impl Connection for VirtualDevice {
    fn send(&mut self, data: &str) -> Result<(), FleetError> {
        if self.closed {
            return Err(FleetError::ChannelDisconnect);
        }
        self.input.push_str(data);
        while let Some(pos) = self.input.find('\n') {
            let line: String = self.input.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            let response = self.respond(line);
            self.queue(response);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>, FleetError> {
        if self.closed {
            return Ok(None);
        }
        match self.output.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => Err(FleetError::ConnectionTimeout(format!(
                "{} sent no further output",
                self.hostname
            ))),
        }
    }

    fn close(&mut self) -> Result<(), FleetError> {
        self.closed = true;
        self.output.clear();
        Ok(())
    }

    fn protocol_banner(&self) -> Option<String> {
        self.protocol_banner.clone()
    }
}

impl fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("hostname", &self.hostname)
            .field("login_type", &self.login_type)
            .field("commands", &self.commands.len())
            .field("logged_in", &self.logged_in)
            .finish_non_exhaustive()
    }
}

type DeviceFactory = dyn Fn(&Host) -> Result<VirtualDevice, FleetError> + Send + Sync;

/// Connects every host to a fresh [`VirtualDevice`] built by a factory.
#[derive(Clone)]
pub struct VirtualConnector {
    factory: Arc<DeviceFactory>,
    connections: Arc<AtomicUsize>,
}

impl VirtualConnector {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&Host) -> Result<VirtualDevice, FleetError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Connector for VirtualConnector {
    fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, FleetError> {
        let device = (self.factory)(host)?;
        self.connections.fetch_add(1, Ordering::SeqCst);
        trace!("Virtual connection to {} opened", host.name());
        Ok(Box::new(device))
    }
}

impl fmt::Debug for VirtualConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnector")
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(device: &mut VirtualDevice) -> String {
        let mut out = String::new();
        while let Ok(Some(chunk)) = device.receive() {
            out.push_str(&chunk);
        }
        out
    }

    #[test]
    fn full_login_walks_user_and_password_prompts() {
        let mut device = VirtualDevice::new("r1");
        assert_eq!(drain(&mut device), "Welcome to r1!\nUser: ");
        device.send("admin\n").expect("send user");
        assert_eq!(drain(&mut device), "admin\nPassword: ");
        device.send("secret\n").expect("send password");
        assert_eq!(drain(&mut device), "\nr1> ");
        assert!(device.is_logged_in());
    }

    #[test]
    fn login_types_skip_prompts() {
        let mut device = VirtualDevice::new("r1").with_login_type(LoginType::PasswordOnly);
        assert_eq!(drain(&mut device), "Welcome to r1!\nPassword: ");

        let mut device = VirtualDevice::new("r1").with_login_type(LoginType::UserOnly);
        assert_eq!(drain(&mut device), "Welcome to r1!\nUser: ");
        device.send("admin\n").expect("send user");
        assert_eq!(drain(&mut device), "admin\nr1> ");

        let mut device = VirtualDevice::new("r1").with_login_type(LoginType::None);
        assert_eq!(drain(&mut device), "Welcome to r1!\nr1> ");
        assert!(device.is_logged_in());
    }

    #[test]
    fn wrong_password_restarts_the_login() {
        let mut device = VirtualDevice::new("r1").with_credentials("admin", "good");
        drain(&mut device);
        device.send("admin\nbad\n").expect("send");
        assert_eq!(drain(&mut device), "admin\nPassword: \nLogin failed\nUser: ");
        assert!(!device.is_logged_in());
    }

    #[test]
    fn commands_are_echoed_and_answered() {
        let mut device = VirtualDevice::new("r1").with_login_type(LoginType::None);
        device
            .add_response(r"^show version$", "Version 1.0")
            .expect("add command");
        device
            .add_command(r"^echo (.*)$", |line| line.trim_start_matches("echo ").to_string())
            .expect("add command");
        drain(&mut device);

        device.send("show version\r\n").expect("send");
        assert_eq!(drain(&mut device), "show version\nVersion 1.0\nr1> ");
        device.send("echo hi\n").expect("send");
        assert_eq!(drain(&mut device), "echo hi\nhi\nr1> ");
        device.send("bogus\n").expect("send");
        assert_eq!(drain(&mut device), "bogus\n% Invalid input detected\nr1> ");
    }

    #[test]
    fn empty_output_times_out_and_close_ends_the_stream() {
        let mut device = VirtualDevice::new("r1");
        drain(&mut device);
        assert!(matches!(
            device.receive(),
            Err(FleetError::ConnectionTimeout(_))
        ));
        device.close().expect("close");
        assert_eq!(device.receive().expect("eof"), None);
        assert!(matches!(device.send("x\n"), Err(FleetError::ChannelDisconnect)));
    }

    #[test]
    fn chunked_output_is_split_on_char_boundaries() {
        let mut device = VirtualDevice::new("r1")
            .with_banner("héllo\n")
            .with_chunk_size(2);
        let mut chunks = Vec::new();
        while let Ok(Some(chunk)) = device.receive() {
            chunks.push(chunk);
        }
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), "héllo\nUser: ");
    }

    #[test]
    fn connector_builds_a_device_per_host() {
        let connector = VirtualConnector::new(|host: &Host| {
            Ok(VirtualDevice::new(host.name()).with_protocol_banner("SSH-2.0-Cisco-1.25"))
        });
        let conn = connector.connect(&Host::new("r9")).expect("connect");
        assert_eq!(conn.protocol_banner().as_deref(), Some("SSH-2.0-Cisco-1.25"));
        connector.connect(&Host::new("r10")).expect("connect");
        assert_eq!(connector.connections(), 2);
    }
}
