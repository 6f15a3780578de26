//! Device family drivers.
//!
//! A driver bundles the prompt and error patterns of one device family, a
//! score telling how likely a login banner belongs to that family, and the
//! commands that prepare a terminal after login.
//!
//! # Main Components
//!
//! - [`Driver`] - The polymorphic driver interface
//! - [`PatternDriver`] - A driver defined entirely by data
//! - [`DriverBuilder`] - Compiles pattern strings into a [`PatternDriver`]
//! - [`DriverRegistry`] - Ranks drivers for a banner

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use regex::Regex;

use crate::config::{DEFAULT_DRIVER_THRESHOLD, GENERIC_DRIVER};
use crate::error::FleetError;

pub use registry::DriverRegistry;

/// Username prompts recognized when a driver declares none.
pub const GENERIC_USER_PROMPTS: &[&str] = &[r"(?i)(?:user ?name|user|login): ?$"];

/// Password prompts recognized when a driver declares none.
pub const GENERIC_PASSWORD_PROMPTS: &[&str] = &[r"(?i)password: ?$"];

/// Command prompts recognized when a driver declares none.
pub const GENERIC_PROMPTS: &[&str] = &[r"(?:^|[\r\n])[\w\-.:/@~]+(?:\([^)\r\n]*\))?[>#$%] ?$"];

/// Command errors recognized when a driver declares none.
pub const GENERIC_ERRORS: &[&str] = &[
    r"(?i)invalid (?:input|command)",
    r"(?i)(?:incomplete|ambiguous|unknown) command",
    r"(?m)^%",
];

/// Login rejections recognized when a driver declares none.
pub const GENERIC_LOGIN_ERRORS: &[&str] = &[
    r"(?i)login (?:failed|incorrect)",
    r"(?i)authentication failed",
    r"(?i)access denied",
    r"(?i)bad (?:password|secrets)",
];

/// Something a driver can type into.
///
/// Implemented by [`Session`](crate::session::Session). Reads are bounded
/// by the underlying connection's timeouts.
pub trait Terminal {
    /// Writes raw text.
    fn send(&mut self, data: &str) -> Result<(), FleetError>;

    /// Runs a command and returns its output without echo and prompt.
    fn execute(&mut self, command: &str) -> Result<String, FleetError>;
}

/// Policy of one device family.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn user_prompts(&self) -> &[Regex];

    fn password_prompts(&self) -> &[Regex];

    /// Command prompts; a match means the device waits for input.
    fn prompts(&self) -> &[Regex];

    /// Patterns that mark a command's output as failed.
    fn error_prompts(&self) -> &[Regex];

    /// Patterns that mark a login attempt as rejected.
    fn login_error_prompts(&self) -> &[Regex];

    /// Pagination prompts answered with a space.
    fn pager_prompts(&self) -> &[Regex] {
        &[]
    }

    /// Likelihood, from 0 to 100, that `header` was sent by this family.
    fn score(&self, header: &str) -> u8;

    /// Prepares the terminal once logged in, e.g. disables paging.
    fn init_terminal(&self, terminal: &mut dyn Terminal) -> Result<(), FleetError>;

    /// Whether the OS guesser should consider this driver.
    fn supports_os_guesser(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").field("name", &self.name()).finish()
    }
}

/// A driver described by pattern lists and banner score rules.
#[derive(Debug, Clone)]
pub struct PatternDriver {
    name: String,
    user_prompts: Vec<Regex>,
    password_prompts: Vec<Regex>,
    prompts: Vec<Regex>,
    error_prompts: Vec<Regex>,
    login_error_prompts: Vec<Regex>,
    pager_prompts: Vec<Regex>,
    /// Tried in order; the first matching rule gives the score.
    score_rules: Vec<(Regex, u8)>,
    init_commands: Vec<String>,
    os_guesser: bool,
}

impl PatternDriver {
    pub fn builder(name: impl Into<String>) -> DriverBuilder {
        DriverBuilder::new(name)
    }

    pub fn init_commands(&self) -> &[String] {
        &self.init_commands
    }
}

impl Driver for PatternDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn user_prompts(&self) -> &[Regex] {
        &self.user_prompts
    }

    fn password_prompts(&self) -> &[Regex] {
        &self.password_prompts
    }

    fn prompts(&self) -> &[Regex] {
        &self.prompts
    }

    fn error_prompts(&self) -> &[Regex] {
        &self.error_prompts
    }

    fn login_error_prompts(&self) -> &[Regex] {
        &self.login_error_prompts
    }

    fn pager_prompts(&self) -> &[Regex] {
        &self.pager_prompts
    }

    fn score(&self, header: &str) -> u8 {
        self.score_rules
            .iter()
            .find(|(regex, _)| regex.is_match(header))
            .map(|(_, score)| *score)
            .unwrap_or(0)
    }

    fn init_terminal(&self, terminal: &mut dyn Terminal) -> Result<(), FleetError> {
        for command in &self.init_commands {
            trace!("{}: init command '{}'", self.name, command);
            terminal.execute(command)?;
        }
        Ok(())
    }

    fn supports_os_guesser(&self) -> bool {
        self.os_guesser
    }
}

/// Builds a [`PatternDriver`] from pattern strings.
///
/// Pattern lists that are never set fall back to the generic ones.
#[derive(Debug, Clone)]
pub struct DriverBuilder {
    name: String,
    user_prompts: Option<Vec<String>>,
    password_prompts: Option<Vec<String>>,
    prompts: Option<Vec<String>>,
    error_prompts: Option<Vec<String>>,
    login_error_prompts: Option<Vec<String>>,
    pager_prompts: Vec<String>,
    score_rules: Vec<(String, u8)>,
    init_commands: Vec<String>,
    os_guesser: bool,
}

fn owned<I, S>(patterns: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns.into_iter().map(|p| p.as_ref().to_string()).collect()
}

impl DriverBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_prompts: None,
            password_prompts: None,
            prompts: None,
            error_prompts: None,
            login_error_prompts: None,
            pager_prompts: Vec::new(),
            score_rules: Vec::new(),
            init_commands: Vec::new(),
            os_guesser: true,
        }
    }

    pub fn user_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.user_prompts = Some(owned(patterns));
        self
    }

    pub fn password_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.password_prompts = Some(owned(patterns));
        self
    }

    pub fn prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prompts = Some(owned(patterns));
        self
    }

    pub fn error_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.error_prompts = Some(owned(patterns));
        self
    }

    pub fn login_error_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.login_error_prompts = Some(owned(patterns));
        self
    }

    pub fn pager_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.pager_prompts = owned(patterns);
        self
    }

    /// Adds a banner rule. Rules are tried in the order they are added.
    pub fn score_rule(mut self, pattern: impl Into<String>, score: u8) -> Self {
        self.score_rules.push((pattern.into(), score));
        self
    }

    /// Adds a command executed by `init_terminal`.
    pub fn init_command(mut self, command: impl Into<String>) -> Self {
        self.init_commands.push(command.into());
        self
    }

    pub fn supports_os_guesser(mut self, enabled: bool) -> Self {
        self.os_guesser = enabled;
        self
    }

    fn compile(name: &str, patterns: Option<Vec<String>>, fallback: &[&str]) -> Result<Vec<Regex>, FleetError> {
        let patterns = patterns.unwrap_or_else(|| owned(fallback));
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    FleetError::InvalidDriverConfig(format!("{name}: pattern '{p}': {e}"))
                })
            })
            .collect()
    }

    /// Compiles every pattern and validates the score rules.
    pub fn build(self) -> Result<PatternDriver, FleetError> {
        let name = self.name;
        if name.trim().is_empty() {
            return Err(FleetError::InvalidDriverConfig(
                "driver name must not be empty".to_string(),
            ));
        }

        let mut score_rules = Vec::with_capacity(self.score_rules.len());
        for (pattern, score) in self.score_rules {
            if score > 100 {
                return Err(FleetError::InvalidDriverConfig(format!(
                    "{name}: score {score} of rule '{pattern}' exceeds 100"
                )));
            }
            let regex = Self::compile(&name, Some(vec![pattern]), &[])?;
            score_rules.extend(regex.into_iter().map(|r| (r, score)));
        }

        let driver = PatternDriver {
            user_prompts: Self::compile(&name, self.user_prompts, GENERIC_USER_PROMPTS)?,
            password_prompts: Self::compile(&name, self.password_prompts, GENERIC_PASSWORD_PROMPTS)?,
            prompts: Self::compile(&name, self.prompts, GENERIC_PROMPTS)?,
            error_prompts: Self::compile(&name, self.error_prompts, GENERIC_ERRORS)?,
            login_error_prompts: Self::compile(
                &name,
                self.login_error_prompts,
                GENERIC_LOGIN_ERRORS,
            )?,
            pager_prompts: Self::compile(&name, Some(self.pager_prompts), &[])?,
            score_rules,
            init_commands: self.init_commands,
            os_guesser: self.os_guesser,
            name,
        };
        debug!("Driver '{}' built", driver.name);
        Ok(driver)
    }

    /// Builds the driver and wraps it for registration.
    pub fn build_shared(self) -> Result<Arc<dyn Driver>, FleetError> {
        Ok(Arc::new(self.build()?))
    }
}

mod registry;

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<String>);

    impl Terminal for Recorder {
        fn send(&mut self, data: &str) -> Result<(), FleetError> {
            self.0.push(data.to_string());
            Ok(())
        }

        fn execute(&mut self, command: &str) -> Result<String, FleetError> {
            self.0.push(command.to_string());
            Ok(String::new())
        }
    }

    #[test]
    fn unset_pattern_lists_use_generic_defaults() {
        let driver = DriverBuilder::new("plain").build().expect("build");
        assert_eq!(driver.user_prompts().len(), GENERIC_USER_PROMPTS.len());
        assert!(driver.prompts()[0].is_match("Welcome\nrouter1# "));
        assert!(driver.prompts()[0].is_match("sw-01(config)#"));
        assert!(!driver.prompts()[0].is_match("router1#\nsome output"));
        assert!(driver.password_prompts()[0].is_match("Password: "));
        assert!(driver.user_prompts()[0].is_match("Username: "));
        assert!(driver.pager_prompts().is_empty());
    }

    #[test]
    fn first_matching_score_rule_wins() {
        let driver = DriverBuilder::new("ctl")
            .score_rule(r"\(Cisco Controller\)", 90)
            .score_rule(r"\) >", 87)
            .build()
            .expect("build");
        assert_eq!(driver.score("(Cisco Controller) >"), 90);
        assert_eq!(driver.score("(other) >"), 87);
        assert_eq!(driver.score("router#"), 0);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let bad_regex = DriverBuilder::new("x").prompts(["("]).build();
        assert!(matches!(bad_regex, Err(FleetError::InvalidDriverConfig(_))));

        let bad_score = DriverBuilder::new("x").score_rule("a", 101).build();
        assert!(matches!(bad_score, Err(FleetError::InvalidDriverConfig(_))));

        let no_name = DriverBuilder::new(" ").build();
        assert!(matches!(no_name, Err(FleetError::InvalidDriverConfig(_))));
    }

    #[test]
    fn init_terminal_executes_commands_in_order() {
        let driver = DriverBuilder::new("x")
            .init_command("terminal length 0")
            .init_command("terminal width 0")
            .build()
            .expect("build");
        let mut terminal = Recorder(Vec::new());
        driver.init_terminal(&mut terminal).expect("init");
        assert_eq!(terminal.0, vec!["terminal length 0", "terminal width 0"]);
    }
}
