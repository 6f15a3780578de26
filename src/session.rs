//! Interactive device sessions.
//!
//! A [`Session`] drives one connection: incoming text is appended to a
//! [`MonitoredBuffer`] and fed to an [`OsGuesser`] until login completes,
//! prompts are recognized through the active [`Driver`], and pagination
//! prompts are answered automatically.
//!
//! Sessions are created and used on a single worker thread.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, trace};
use regex::{Captures, Regex};

use crate::account::Account;
use crate::buffer::MonitoredBuffer;
use crate::config::{DEFAULT_MONITOR_WINDOW, DEFAULT_OS_CONFIDENCE};
use crate::connection::Connection;
use crate::driver::{Driver, DriverRegistry, Terminal};
use crate::error::FleetError;
use crate::guesser::{OsGuesser, UNKNOWN_OS};
use crate::host::Host;
use crate::logger::JobLogger;
use crate::workqueue::JobId;

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// False when the output matched one of the driver's error patterns.
    pub success: bool,
    /// Output without the echoed command and the trailing prompt.
    pub content: String,
    /// Everything received for the command, prompt included.
    pub all: String,
    /// The prompt that ended the output.
    pub prompt: Option<String>,
}

/// Text consumed by a successful [`Session::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the pattern that matched.
    pub index: usize,
    /// Text received before the match.
    pub before: String,
    /// The matched text itself.
    pub matched: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginPrompt {
    Rejected,
    User,
    Password,
    Command,
}

/// A logged-in (or logging-in) conversation with one device.
pub struct Session {
    host_name: String,
    pinned_driver: Option<String>,
    conn: Box<dyn Connection>,
    buffer: MonitoredBuffer,
    guesser: OsGuesser,
    registry: Arc<DriverRegistry>,
    driver: Arc<dyn Driver>,
    pager_seen: Rc<Cell<bool>>,
    paged_drivers: HashSet<String>,
    monitor_window: usize,
    os_confidence_threshold: u8,
    logger: Option<(JobLogger, JobId)>,
    prompt: Option<String>,
    closed: bool,
}

impl Session {
    /// Wraps an open connection to `host`.
    ///
    /// A driver pinned through the host's `driver` option must be
    /// registered; it is used from the first byte on.
    pub fn new(
        host: &Host,
        conn: Box<dyn Connection>,
        registry: Arc<DriverRegistry>,
    ) -> Result<Self, FleetError> {
        let pinned_driver = host.driver().map(str::to_string);
        let driver = match &pinned_driver {
            Some(name) => registry.get(name)?,
            None => registry.fallback(),
        };
        let mut guesser = OsGuesser::new(registry.clone());
        guesser.protocol_info(conn.protocol_banner().as_deref());

        let mut session = Self {
            host_name: host.name().to_string(),
            pinned_driver,
            conn,
            buffer: MonitoredBuffer::new(),
            guesser,
            registry,
            driver,
            pager_seen: Rc::new(Cell::new(false)),
            paged_drivers: HashSet::new(),
            monitor_window: DEFAULT_MONITOR_WINDOW,
            os_confidence_threshold: DEFAULT_OS_CONFIDENCE,
            logger: None,
            prompt: None,
            closed: false,
        };
        session.watch_pager();
        Ok(session)
    }

    /// Records received data into `logger` under `job_id`.
    pub fn with_logger(mut self, logger: JobLogger, job_id: JobId) -> Self {
        self.logger = Some((logger, job_id));
        self
    }

    pub fn with_monitor_window(mut self, window: usize) -> Self {
        self.monitor_window = window;
        self
    }

    /// Minimum confidence for the guessed OS to choose the driver.
    pub fn with_os_confidence_threshold(mut self, threshold: u8) -> Self {
        self.os_confidence_threshold = threshold;
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn guesser(&self) -> &OsGuesser {
        &self.guesser
    }

    pub fn buffer(&self) -> &MonitoredBuffer {
        &self.buffer
    }

    /// The last prompt seen.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Best current guess of the device OS.
    pub fn guess_os(&self) -> &str {
        self.guesser.get("os", None).unwrap_or(UNKNOWN_OS)
    }

    /// Switches to a registered driver by name.
    pub fn set_driver(&mut self, name: &str) -> Result<(), FleetError> {
        self.driver = self.registry.get(name)?;
        self.watch_pager();
        Ok(())
    }

    /// Registers a monitor on the session buffer.
    pub fn add_monitor<I, S, F>(&mut self, patterns: I, callback: F) -> Result<(), FleetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(usize, &Captures<'_>) + 'static,
    {
        self.buffer
            .add_monitor_with_limit(patterns, callback, self.monitor_window)
    }

    fn watch_pager(&mut self) {
        let driver = self.driver.clone();
        if driver.pager_prompts().is_empty() || !self.paged_drivers.insert(driver.name().to_string()) {
            return;
        }
        let seen = self.pager_seen.clone();
        self.buffer.add_compiled_monitor(
            driver.pager_prompts().to_vec(),
            move |_, _| seen.set(true),
            self.monitor_window,
        );
    }

    fn on_data(&mut self, data: &str) -> Result<(), FleetError> {
        trace!("{} <- {:?}", self.host_name, data);
        if let Some((logger, job_id)) = &self.logger {
            logger.record_data(*job_id, data)?;
        }
        self.guesser.data_received(data, false);
        self.buffer.append(data);
        if self.pager_seen.replace(false) {
            trace!("{}: answering pager prompt", self.host_name);
            self.conn.send(" ")?;
        }
        Ok(())
    }

    fn receive_chunk(&mut self) -> Result<(), FleetError> {
        match self.conn.receive() {
            Ok(Some(data)) => self.on_data(&data),
            Ok(None) => Err(FleetError::ChannelDisconnect),
            Err(FleetError::ConnectionTimeout(_)) => Err(FleetError::ConnectionTimeout(
                self.buffer.tail(self.monitor_window).to_string(),
            )),
            Err(err) => Err(err),
        }
    }

    /// Writes raw text to the device.
    pub fn send(&mut self, data: &str) -> Result<(), FleetError> {
        if self.closed {
            return Err(FleetError::ChannelDisconnect);
        }
        trace!("{} -> {:?}", self.host_name, data);
        self.conn.send(data)
    }

    /// Reads until one of `patterns` matches, consuming the buffer through
    /// the end of the match.
    pub fn expect_regex(&mut self, patterns: &[Regex]) -> Result<ExpectMatch, FleetError> {
        loop {
            let found = patterns.iter().enumerate().find_map(|(index, regex)| {
                regex
                    .find(self.buffer.as_str())
                    .map(|m| (index, m.start(), m.end()))
            });
            if let Some((index, start, end)) = found {
                let consumed = self.buffer.pop(end);
                return Ok(ExpectMatch {
                    index,
                    before: consumed[..start].to_string(),
                    matched: consumed[start..].to_string(),
                });
            }
            self.receive_chunk()?;
        }
    }

    /// Like [`expect_regex`](Self::expect_regex), compiling the patterns first.
    pub fn expect<S: AsRef<str>>(&mut self, patterns: &[S]) -> Result<ExpectMatch, FleetError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.expect_regex(&patterns)
    }

    /// Waits for the driver's command prompt.
    pub fn expect_prompt(&mut self) -> Result<ExpectMatch, FleetError> {
        let driver = self.driver.clone();
        let found = self.expect_regex(driver.prompts())?;
        self.prompt = Some(found.matched.trim().to_string());
        Ok(found)
    }

    /// Walks the device's login dialog with `account`.
    ///
    /// Fails with [`FleetError::AuthenticationFailure`] when the device
    /// rejects the login or asks for the same credential twice. After
    /// login the driver is chosen from the host's pinned driver, the OS
    /// guess, or the banner score, in that order.
    pub fn login(&mut self, account: &Account) -> Result<(), FleetError> {
        let driver = self.driver.clone();
        let mut patterns = Vec::new();
        let mut kinds = Vec::new();
        for (kind, group) in [
            (LoginPrompt::Rejected, driver.login_error_prompts()),
            (LoginPrompt::User, driver.user_prompts()),
            (LoginPrompt::Password, driver.password_prompts()),
            (LoginPrompt::Command, driver.prompts()),
        ] {
            patterns.extend(group.iter().cloned());
            kinds.extend(std::iter::repeat_n(kind, group.len()));
        }

        let rejected = || FleetError::AuthenticationFailure {
            user: account.name().to_string(),
        };
        let mut user_sent = false;
        let mut password_sent = false;
        loop {
            let found = self.expect_regex(&patterns)?;
            match kinds[found.index] {
                LoginPrompt::Rejected => return Err(rejected()),
                LoginPrompt::User => {
                    if user_sent {
                        return Err(rejected());
                    }
                    user_sent = true;
                    self.send(&format!("{}\n", account.name()))?;
                }
                LoginPrompt::Password => {
                    if password_sent {
                        return Err(rejected());
                    }
                    password_sent = true;
                    self.send(&format!("{}\n", account.password()))?;
                }
                LoginPrompt::Command => {
                    self.prompt = Some(found.matched.trim().to_string());
                    break;
                }
            }
        }

        debug!("{}: logged in as '{}'", self.host_name, account.name());
        self.guesser.set_authenticated();
        self.select_driver()
    }

    fn select_driver(&mut self) -> Result<(), FleetError> {
        let driver = if let Some(name) = &self.pinned_driver {
            self.registry.get(name)?
        } else if let Some(os) = self
            .guesser
            .get("os", Some(self.os_confidence_threshold))
            && os != UNKNOWN_OS
            && let Ok(driver) = self.registry.get(os)
        {
            driver
        } else {
            self.registry.best_match(self.guesser.header())
        };
        debug!("{}: using driver '{}'", self.host_name, driver.name());
        self.driver = driver;
        self.watch_pager();
        Ok(())
    }

    /// Runs the driver's terminal setup.
    pub fn auto_init_terminal(&mut self) -> Result<(), FleetError> {
        let driver = self.driver.clone();
        driver.init_terminal(self)
    }

    /// Sends `command` and collects its output up to the next prompt.
    pub fn write(&mut self, command: &str) -> Result<Output, FleetError> {
        self.send(&format!("{command}\n"))?;
        let driver = self.driver.clone();
        let found = self.expect_prompt()?;
        let all = format!("{}{}", found.before, found.matched);

        // Remove the echoed command from the beginning of the output
        let mut content = found.before.trim_start_matches([' ', '\r', '\n']);
        if !command.is_empty()
            && let Some(rest) = content.strip_prefix(command)
        {
            content = rest.trim_start_matches(['\r', '\n']);
        }
        let content = content.trim_end_matches(['\r', '\n']).to_string();

        let success = !driver.error_prompts().iter().any(|re| re.is_match(&content));
        if !success {
            debug!("{}: '{}' reported an error", self.host_name, command);
        }
        Ok(Output {
            success,
            content,
            all,
            prompt: self.prompt.clone(),
        })
    }

    /// Runs a command, failing with [`FleetError::CommandFailed`] when the
    /// device reports an error.
    pub fn execute(&mut self, command: &str) -> Result<String, FleetError> {
        let output = self.write(command)?;
        if !output.success {
            return Err(FleetError::CommandFailed {
                command: command.to_string(),
                output: output.content,
            });
        }
        Ok(output.content)
    }

    /// Closes the connection. Further sends fail.
    pub fn close(&mut self) -> Result<(), FleetError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("{}: closing session", self.host_name);
        self.conn.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Terminal for Session {
    fn send(&mut self, data: &str) -> Result<(), FleetError> {
        Session::send(self, data)
    }

    fn execute(&mut self, command: &str) -> Result<String, FleetError> {
        Session::execute(self, command)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!("{}: close on drop failed: {}", self.host_name, err);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host_name)
            .field("driver", &self.driver.name())
            .field("os", &self.guess_os())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{LoginType, VirtualDevice};
    use crate::driver::DriverBuilder;
    use crate::logger::RecordLevel;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn registry() -> Arc<DriverRegistry> {
        Arc::new(DriverRegistry::with_builtin_drivers().expect("registry"))
    }

    fn device(name: &str) -> VirtualDevice {
        let mut device = VirtualDevice::new(name).with_credentials("admin", "pw");
        device
            .add_response(r"^show version$", "Version 1.0")
            .expect("add command");
        device
            .add_response(r"^terminal (?:length|width) 0$", "")
            .expect("add command");
        device
    }

    fn open(device: VirtualDevice, host: &Host) -> Session {
        Session::new(host, Box::new(device), registry()).expect("session")
    }

    #[test]
    fn login_then_execute_returns_clean_output() {
        let mut session = open(device("r1"), &Host::new("r1"));
        session.login(&Account::new("admin", "pw")).expect("login");
        assert_eq!(session.prompt(), Some("r1>"));
        assert_eq!(session.execute("show version").expect("execute"), "Version 1.0");

        let output = session.write("show version").expect("write");
        assert!(output.success);
        assert!(output.all.starts_with("show version\n"));
        assert!(output.all.ends_with("r1> "));
    }

    #[test]
    fn wrong_password_is_an_authentication_failure() {
        let mut session = open(device("r1"), &Host::new("r1"));
        let err = session
            .login(&Account::new("admin", "wrong"))
            .expect_err("login must fail");
        assert!(matches!(err, FleetError::AuthenticationFailure { user } if user == "admin"));
    }

    #[test]
    fn repeated_password_prompt_is_an_authentication_failure() {
        // Answers the password prompt with another password prompt.
        let device = VirtualDevice::new("r1")
            .with_login_type(LoginType::PasswordOnly)
            .with_prompt("Password: ");
        let mut session = open(device, &Host::new("r1"));
        assert!(matches!(
            session.login(&Account::new("admin", "pw")),
            Err(FleetError::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn device_errors_fail_the_command() {
        let mut session = open(device("r1"), &Host::new("r1"));
        session.login(&Account::new("admin", "pw")).expect("login");
        let err = session.execute("reload now").expect_err("unknown command");
        assert!(
            matches!(err, FleetError::CommandFailed { command, output } if command == "reload now" && output.contains("Invalid input"))
        );
    }

    #[test]
    fn missing_output_times_out_with_buffer_tail() {
        let mut session = open(device("r1"), &Host::new("r1"));
        let err = session.expect(&["never"]).expect_err("timeout");
        assert!(matches!(err, FleetError::ConnectionTimeout(tail) if tail.contains("User: ")));
    }

    #[test]
    fn protocol_banner_selects_the_driver() {
        let device = device("r1").with_protocol_banner("SSH-2.0-Cisco-1.25");
        let mut session = open(device, &Host::new("r1"));
        assert_eq!(session.guess_os(), "ios");
        session.login(&Account::new("admin", "pw")).expect("login");
        assert_eq!(session.driver().name(), "ios");
        session.auto_init_terminal().expect("init terminal");
    }

    #[test]
    fn pinned_driver_must_exist() {
        let err = Session::new(
            &Host::new("r1").with_driver("nope"),
            Box::new(device("r1")),
            registry(),
        )
        .expect_err("unknown driver");
        assert!(matches!(err, FleetError::DriverNotFound(_)));

        let mut session = open(device("r1"), &Host::new("r1").with_driver("arista"));
        session.login(&Account::new("admin", "pw")).expect("login");
        assert_eq!(session.driver().name(), "arista");
    }

    #[test]
    fn received_data_is_recorded() {
        let logger = JobLogger::new(RecordLevel::Full);
        let mut session = open(device("r1"), &Host::new("r1")).with_logger(logger.clone(), 4);
        session.login(&Account::new("admin", "pw")).expect("login");
        let transcripts = logger.transcripts().expect("transcripts");
        let text = transcripts.get(&4).expect("job transcript");
        assert!(text.starts_with("Welcome to r1!\nUser: "));
        assert!(text.ends_with("r1> "));
    }

    struct PagedConnection {
        pending: VecDeque<String>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Connection for PagedConnection {
        fn send(&mut self, data: &str) -> Result<(), FleetError> {
            self.sent.lock().expect("sent lock").push(data.to_string());
            match data {
                "show run\n" => self.pending.push_back("show run\nline1\n--More--".to_string()),
                " " => self.pending.push_back("\nline2\nr1# ".to_string()),
                _ => {}
            }
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<String>, FleetError> {
            self.pending
                .pop_front()
                .map(Some)
                .ok_or_else(|| FleetError::ConnectionTimeout(String::new()))
        }

        fn close(&mut self) -> Result<(), FleetError> {
            Ok(())
        }
    }

    #[test]
    fn pager_prompts_are_answered_with_a_space() {
        let mut registry = DriverRegistry::new().expect("registry");
        registry
            .register(
                DriverBuilder::new("paged")
                    .pager_prompts([r"--More--$"])
                    .build_shared()
                    .expect("driver"),
            )
            .expect("register");

        let sent = Arc::new(Mutex::new(Vec::new()));
        let conn = PagedConnection {
            pending: VecDeque::from(["r1# ".to_string()]),
            sent: sent.clone(),
        };
        let mut session = Session::new(
            &Host::new("r1").with_driver("paged"),
            Box::new(conn),
            Arc::new(registry),
        )
        .expect("session");
        session.login(&Account::new("admin", "pw")).expect("login");

        let output = session.execute("show run").expect("execute");
        assert!(output.starts_with("line1"));
        assert!(output.ends_with("line2"));
        assert_eq!(
            *sent.lock().expect("sent lock"),
            vec!["show run\n".to_string(), " ".to_string()]
        );
    }
}
