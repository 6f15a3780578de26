//! Confidence-scored device OS detection.
//!
//! The guesser collects weak signals about the remote device (the
//! transport's version banner, the text shown before login) and keeps,
//! per attribute, the value backed by the strongest signal seen so far.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{CONFIDENCE_PROTOCOL_BANNER, CONFIDENCE_UNKNOWN, CONFIDENCE_WEAK_BANNER};
use crate::driver::DriverRegistry;

/// Value of the `os` attribute before anything was recognized.
pub const UNKNOWN_OS: &str = "unknown";

/// Protocol banner rules; the first matching rule wins.
static BANNER_RULES: Lazy<Vec<(Regex, &'static str, u8)>> = Lazy::new(|| {
    [
        (r"^SSH-[\d.]+-Cisco", "ios", CONFIDENCE_PROTOCOL_BANNER),
        (r"^SSH-[\d.]+-HUAWEI", "vrp", CONFIDENCE_PROTOCOL_BANNER),
        (r"^SSH-[\d.]+-OpenSSH", "linux", CONFIDENCE_WEAK_BANNER),
    ]
    .into_iter()
    .map(|(pattern, os, confidence)| match Regex::new(pattern) {
        Ok(re) => (re, os, confidence),
        Err(err) => panic!("invalid banner rule '{pattern}': {err}"),
    })
    .collect()
});

/// Per-session store of guessed attributes.
///
/// An attribute only changes when a signal at least as confident as the
/// stored one arrives.
#[derive(Debug)]
pub struct OsGuesser {
    registry: Arc<DriverRegistry>,
    info: HashMap<String, (String, u8)>,
    header: String,
    authenticated: bool,
}

impl OsGuesser {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        let mut guesser = Self {
            registry,
            info: HashMap::new(),
            header: String::new(),
            authenticated: false,
        };
        guesser.reset();
        guesser
    }

    /// Forgets everything and reports the OS as unknown again.
    pub fn reset(&mut self) {
        self.info.clear();
        self.header.clear();
        self.authenticated = false;
        self.set("os", UNKNOWN_OS, CONFIDENCE_UNKNOWN);
    }

    /// Stores `value` unless the attribute holds a more confident one.
    pub fn set(&mut self, attr: &str, value: impl Into<String>, confidence: u8) {
        if let Some((_, stored)) = self.info.get(attr)
            && confidence < *stored
        {
            return;
        }
        let value = value.into();
        trace!("Guess {}={} ({})", attr, value, confidence);
        self.info.insert(attr.to_string(), (value, confidence));
    }

    /// Returns the attribute if its confidence reaches `threshold`.
    pub fn get(&self, attr: &str, threshold: Option<u8>) -> Option<&str> {
        let (value, confidence) = self.info.get(attr)?;
        match threshold {
            Some(min) if *confidence < min => None,
            _ => Some(value.as_str()),
        }
    }

    /// Confidence of the stored attribute.
    pub fn confidence(&self, attr: &str) -> Option<u8> {
        self.info.get(attr).map(|(_, confidence)| *confidence)
    }

    /// Sets `attr` from the first candidate whose pattern occurs in `text`.
    pub fn set_from_match<S: AsRef<str>>(
        &mut self,
        attr: &str,
        candidates: &[(Regex, S, u8)],
        text: &str,
    ) {
        if let Some((_, value, confidence)) = candidates.iter().find(|(re, _, _)| re.is_match(text))
        {
            self.set(attr, value.as_ref(), *confidence);
        }
    }

    /// Feeds text shown by the device before login completes.
    ///
    /// The accumulated header is scored against the registered drivers
    /// whenever a line ends.
    pub fn data_received(&mut self, data: &str, is_line_end: bool) {
        if self.authenticated {
            return;
        }
        self.header.push_str(data);
        if is_line_end || data.contains('\n') {
            self.evaluate_header();
        }
    }

    /// Scores the header collected so far and records the best driver.
    pub fn evaluate_header(&mut self) {
        let best = self
            .registry
            .ranked(&self.header)
            .into_iter()
            .find(|(driver, _)| driver.supports_os_guesser());
        if let Some((driver, score)) = best
            && score > CONFIDENCE_UNKNOWN
        {
            let name = driver.name().to_string();
            self.set("os", name, score);
        }
    }

    /// Interprets a version-exchange banner such as `SSH-2.0-Cisco-1.25`.
    pub fn protocol_info(&mut self, banner: Option<&str>) {
        let banner = banner.map(str::trim).unwrap_or_default();
        if banner.is_empty() {
            self.set("os", UNKNOWN_OS, CONFIDENCE_UNKNOWN);
            return;
        }
        debug!("Protocol banner: {}", banner);
        self.set("protocol_info", banner, CONFIDENCE_PROTOCOL_BANNER);
        self.set_from_match("os", &BANNER_RULES, banner);
    }

    /// Stops header collection; later data is ordinary session output.
    pub fn set_authenticated(&mut self) {
        if !self.authenticated {
            self.evaluate_header();
            self.authenticated = true;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Text collected before authentication.
    pub fn header(&self) -> &str {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guesser() -> OsGuesser {
        OsGuesser::new(Arc::new(
            DriverRegistry::with_builtin_drivers().expect("registry"),
        ))
    }

    fn check_set(guesser: &mut OsGuesser) {
        assert_eq!(guesser.get("test", None), None);
        assert_eq!(guesser.get("test", Some(0)), None);
        assert_eq!(guesser.get("test", Some(100)), None);

        guesser.set("test", "foo", 0);
        assert_eq!(guesser.get("test", None), Some("foo"));
        assert_eq!(guesser.get("test", Some(0)), Some("foo"));
        assert_eq!(guesser.get("test", Some(10)), None);

        guesser.set("test", "foo", 10);
        assert_eq!(guesser.get("test", Some(10)), Some("foo"));
        assert_eq!(guesser.get("test", Some(11)), None);

        guesser.set("test", "bar", 5);
        assert_eq!(guesser.get("test", None), Some("foo"));
        assert_eq!(guesser.get("test", Some(10)), Some("foo"));
    }

    #[test]
    fn lower_confidence_never_downgrades() {
        let mut guesser = guesser();
        check_set(&mut guesser);
    }

    #[test]
    fn reset_restores_the_initial_state() {
        let mut guesser = guesser();
        check_set(&mut guesser);
        guesser.set("os", "ios", 90);
        guesser.reset();
        check_set(&mut guesser);
        assert_eq!(guesser.get("os", None), Some(UNKNOWN_OS));
        assert_eq!(guesser.confidence("os"), Some(CONFIDENCE_UNKNOWN));
    }

    #[test]
    fn equal_confidence_overwrites() {
        let mut guesser = guesser();
        guesser.set("os", "x", 10);
        guesser.set("os", "y", 5);
        assert_eq!(guesser.get("os", None), Some("x"));
        guesser.set("os", "y", 10);
        assert_eq!(guesser.get("os", None), Some("y"));
    }

    #[test]
    fn set_from_match_uses_candidate_order() {
        let mut guesser = guesser();
        let candidates = [
            (Regex::new("on").expect("regex"), "uno", 50),
            (Regex::new("two").expect("regex"), "doe", 0),
            (Regex::new("one").expect("regex"), "eins", 90),
        ];
        guesser.set_from_match("test", &candidates, "2two2");
        assert_eq!(guesser.get("test", None), Some("doe"));
        guesser.set_from_match("test", &candidates, "2one2");
        assert_eq!(guesser.get("test", None), Some("uno"));
        assert_eq!(guesser.confidence("test"), Some(50));
    }

    #[test]
    fn protocol_banner_sets_os() {
        let mut guesser = guesser();
        guesser.protocol_info(Some(""));
        assert_eq!(guesser.get("os", None), Some(UNKNOWN_OS));
        guesser.protocol_info(None);
        assert_eq!(guesser.get("os", None), Some(UNKNOWN_OS));
        guesser.protocol_info(Some("SSH-2.0-Cisco-1.25"));
        assert_eq!(guesser.get("os", None), Some("ios"));
        assert_eq!(guesser.get("protocol_info", None), Some("SSH-2.0-Cisco-1.25"));

        guesser.protocol_info(Some("SSH-2.0-OpenSSH_8.9"));
        assert_eq!(guesser.get("os", None), Some("ios"));
    }

    #[test]
    fn header_is_scored_per_line() {
        let mut guesser = guesser();
        for ch in "\r\n(Cisco Controller)\r\nUser: ".chars() {
            guesser.data_received(&ch.to_string(), false);
        }
        assert_eq!(guesser.get("os", Some(50)), Some("aironet"));
        assert_eq!(guesser.confidence("os"), Some(90));
    }

    #[test]
    fn prompt_without_newline_is_scored_on_authentication() {
        let mut guesser = guesser();
        guesser.data_received("Welcome\n", false);
        assert_eq!(guesser.get("os", Some(1)), None);
        guesser.data_received("RP/0/RSP0/CPU0:pe1#", false);
        assert_eq!(guesser.get("os", Some(1)), None);
        guesser.set_authenticated();
        assert_eq!(guesser.get("os", None), Some("ios_xr"));

        guesser.data_received("\nHuawei Versatile Routing Platform\n", true);
        assert_eq!(guesser.get("os", None), Some("ios_xr"));
    }
}
