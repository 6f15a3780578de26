//! Predefined device drivers.
//!
//! This module contains factory functions that build [`PatternDriver`]
//! instances for common device families, pre-configured with their
//! prompts, error messages, banner score rules and terminal setup.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::GENERIC_DRIVER;
use crate::driver::{DriverBuilder, PatternDriver};
use crate::error::FleetError;

/// Built-in driver names, in registration order.
pub const BUILTIN_DRIVERS: &[&str] = &[
    GENERIC_DRIVER,
    "ios",
    "ios_xr",
    "nxos",
    "aironet",
    "junos",
    "vrp",
    "arista",
    "linux",
];

/// Metadata for a built-in driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DriverMetadata {
    pub name: String,
    pub vendor: String,
    pub family: String,
    /// Commands sent by `init_terminal`.
    pub init_commands: Vec<String>,
}

fn metadata_for(name: &str) -> Option<(&'static str, &'static str)> {
    let meta = match name {
        "generic" => ("Any", "Generic CLI"),
        "ios" => ("Cisco", "IOS/IOS-XE"),
        "ios_xr" => ("Cisco", "IOS-XR"),
        "nxos" => ("Cisco", "NX-OS"),
        "aironet" => ("Cisco", "Wireless Controller"),
        "junos" => ("Juniper", "JunOS"),
        "vrp" => ("Huawei", "VRP"),
        "arista" => ("Arista", "EOS"),
        "linux" => ("Any", "Unix shell"),
        _ => return None,
    };
    Some(meta)
}

/// Returns names of all built-in drivers.
pub fn available_drivers() -> &'static [&'static str] {
    BUILTIN_DRIVERS
}

/// Returns metadata for one driver by name (case-insensitive).
pub fn driver_metadata(name: &str) -> Result<DriverMetadata, FleetError> {
    let key = name.to_ascii_lowercase();
    let (vendor, family) =
        metadata_for(&key).ok_or_else(|| FleetError::DriverNotFound(name.to_string()))?;
    let driver = by_name(&key)?;
    Ok(DriverMetadata {
        name: key,
        vendor: vendor.to_string(),
        family: family.to_string(),
        init_commands: driver.init_commands().to_vec(),
    })
}

/// Returns metadata for all built-in drivers.
pub fn driver_catalog() -> Result<Vec<DriverMetadata>, FleetError> {
    BUILTIN_DRIVERS.iter().map(|name| driver_metadata(name)).collect()
}

/// Exports the driver catalog as pretty JSON.
pub fn driver_catalog_json() -> Result<String, FleetError> {
    Ok(serde_json::to_string_pretty(&driver_catalog()?)?)
}

/// Creates a built-in driver by name (case-insensitive).
pub fn by_name(name: &str) -> Result<PatternDriver, FleetError> {
    match name.to_ascii_lowercase().as_str() {
        "generic" => generic(),
        "ios" => ios(),
        "ios_xr" => ios_xr(),
        "nxos" => nxos(),
        "aironet" => aironet(),
        "junos" => junos(),
        "vrp" => vrp(),
        "arista" => arista(),
        "linux" => linux(),
        _ => Err(FleetError::DriverNotFound(name.to_string())),
    }
}

/// Fallback driver: generic patterns, never recognized from a banner.
pub fn generic() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new(GENERIC_DRIVER)
        .supports_os_guesser(false)
        .build()
}

const CISCO_PROMPT: &str = r"(?:^|[\r\n])[\-\w+.:/]+(?:\([^)\r\n]+\))?[>#] ?$";

/// Cisco IOS and IOS-XE.
pub fn ios() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new("ios")
        .user_prompts([r"(?i)(?:^|[\r\n])(?:username|login): ?$"])
        .password_prompts([r"(?i)(?:^|[\r\n])(?:current )?password: ?$"])
        .prompts([CISCO_PROMPT])
        .error_prompts([
            r#"%Type "show \?" for a list of subcommands"#,
            r"(?m)^%(?:\s*)(?:Invalid|Incomplete|Ambiguous|Unknown|Bad|Error)",
            r"(?i)invalid input",
            r"(?i)(?:incomplete|ambiguous) command",
            r"(?i)connection timed out",
            r"(?m)^Command authorization failed",
            r"(?m)^Command rejected:",
        ])
        .pager_prompts([r" ?--More-- ?$", r"\s*<--- More --->\s*$"])
        .score_rule(r"User Access Verification", 60)
        .score_rule(r"(?i)cisco ios", 60)
        .score_rule(CISCO_PROMPT, 35)
        .init_command("terminal length 0")
        .init_command("terminal width 0")
        .build()
}

/// Cisco IOS-XR.
pub fn ios_xr() -> Result<PatternDriver, FleetError> {
    let prompt = r"(?:^|[\r\n])RP/\d+/(?:RS?P)?\d+/CPU\d+:[^#\r\n]+(?:\([^)\r\n]+\))?# ?$";
    DriverBuilder::new("ios_xr")
        .user_prompts([r"(?i)(?:^|[\r\n])username: ?$"])
        .password_prompts([r"(?i)(?:^|[\r\n])password: ?$"])
        .prompts([prompt])
        .error_prompts([
            r"(?m)^%\s*(?:Invalid|Incomplete|Ambiguous)",
            r"(?i)invalid input",
            r"(?m)^\s*\^$",
        ])
        .pager_prompts([r" ?--More-- ?$"])
        .score_rule(r"RP/\d+/(?:RS?P)?\d+/CPU\d+:", 95)
        .score_rule(r"(?i)ios xr", 90)
        .init_command("terminal exec prompt no-timestamp")
        .init_command("terminal length 0")
        .build()
}

/// Cisco NX-OS.
pub fn nxos() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new("nxos")
        .user_prompts([r"(?i)(?:^|[\r\n])login: ?$"])
        .prompts([CISCO_PROMPT])
        .error_prompts([
            r"(?m)^%\s*(?:Invalid|Incomplete|Ambiguous)",
            r"(?i)invalid (?:command|input)",
            r"(?m)^Syntax error while parsing",
        ])
        .pager_prompts([r" ?--More-- ?$"])
        .score_rule(r"Cisco Nexus Operating System", 88)
        .score_rule(r"NX-OS", 88)
        .init_command("terminal length 0")
        .init_command("terminal width 511")
        .build()
}

/// Cisco Aironet wireless controllers.
pub fn aironet() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new("aironet")
        .user_prompts([r"(?i)User:\s$"])
        .password_prompts([r"(?:[\r\n]Password: ?|last resort password:)$"])
        .prompts([r"(?:^|[\r\n])\([^)\r\n]+\)\s>$"])
        .error_prompts([
            r"(?i)Incorrect\susage",
            r"(?i)Incorrect\sinput",
            r"(?i)connection timed out",
            r"(?i)[^\r\n]+ not found",
        ])
        .pager_prompts([r"--More-- or \(q\)uit$"])
        .score_rule(r"\(Cisco Controller\)", 90)
        .score_rule(r"\(WiSM-slot", 90)
        .score_rule(r"\) >", 87)
        .init_command("config paging disable")
        .build()
}

/// Juniper JunOS.
pub fn junos() -> Result<PatternDriver, FleetError> {
    let prompt = r"(?:^|[\r\n])[\w\-.]+@[\-\w+.:]+[%>#] ?$";
    DriverBuilder::new("junos")
        .user_prompts([r"(?:^|[\r\n])login: ?$"])
        .password_prompts([r"(?:^|[\r\n])(?:Local )?[Pp]assword: ?$"])
        .prompts([prompt])
        .error_prompts([
            r"(?m)^error:",
            r"(?m)^syntax error",
            r"(?m)^unknown command",
            r"(?m)^\s*\^$",
        ])
        .pager_prompts([r"---\(more(?: \d+%)?\)---$"])
        .score_rule(r"JUNOS", 80)
        .score_rule(r"(?i)juniper", 70)
        .score_rule(prompt, 40)
        .init_command("set cli screen-length 0")
        .init_command("set cli screen-width 0")
        .build()
}

/// Huawei VRP.
pub fn vrp() -> Result<PatternDriver, FleetError> {
    let prompt = r"(?:^|[\r\n])(?:HRP_[MS])?[<\[][\w\-.:/~]+[>\]] ?$";
    DriverBuilder::new("vrp")
        .prompts([prompt])
        .error_prompts([r"(?m)^Error: .+$", r"(?m)^\s*\^$"])
        .pager_prompts([r"\s*---- More ----\s*$"])
        .score_rule(r"Huawei Versatile Routing Platform", 80)
        .score_rule(r"(?i)huawei", 60)
        .score_rule(prompt, 40)
        .init_command("screen-length 0 temporary")
        .build()
}

/// Arista EOS.
pub fn arista() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new("arista")
        .prompts([CISCO_PROMPT])
        .error_prompts([
            r"(?m)^%\s*(?:Invalid|Incomplete|Ambiguous)",
            r"(?m)^% Unavailable command",
        ])
        .pager_prompts([r" ?--More-- ?$"])
        .score_rule(r"(?i)arista networks", 70)
        .score_rule(r"(?i)\beos\b", 45)
        .init_command("terminal length 0")
        .init_command("terminal width 32767")
        .build()
}

/// Unix shells.
pub fn linux() -> Result<PatternDriver, FleetError> {
    DriverBuilder::new("linux")
        .user_prompts([r"(?i)(?:^|[\r\n])[\w\-. ]*login: ?$"])
        .prompts([r"(?:^|[\r\n])[\[(]?(?:\w+@)?[\w\-.]+(?::\S*)?[\])]?[#$%] ?$"])
        .error_prompts([
            r"(?m): command not found$",
            r"(?m): No such file or directory$",
            r"(?m): Permission denied$",
        ])
        .login_error_prompts([r"(?i)login incorrect", r"(?i)permission denied, please try again"])
        .score_rule(r"(?i)ubuntu|debian|centos|red hat|fedora", 70)
        .score_rule(r"\bLinux\b", 70)
        .score_rule(r"(?:^|[\r\n])\w+@[\w\-.]+:\S*[#$] ?$", 50)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;

    #[test]
    fn every_builtin_driver_builds() {
        for name in available_drivers() {
            let driver = by_name(name).expect("builtin driver");
            assert_eq!(driver.name(), *name);
        }
        assert!(matches!(by_name("nope"), Err(FleetError::DriverNotFound(_))));
    }

    #[test]
    fn catalog_covers_all_builtins() {
        let catalog = driver_catalog().expect("catalog");
        assert_eq!(catalog.len(), BUILTIN_DRIVERS.len());
        let ios = driver_metadata("IOS").expect("ios metadata");
        assert_eq!(ios.vendor, "Cisco");
        assert_eq!(ios.init_commands, vec!["terminal length 0", "terminal width 0"]);
        let json = driver_catalog_json().expect("catalog json");
        assert!(json.contains("\"aironet\""));
    }

    #[test]
    fn aironet_scores_controller_banners() {
        let driver = aironet().expect("aironet");
        assert_eq!(driver.score("(Cisco Controller)\nUser: "), 90);
        assert_eq!(driver.score("(WiSM-slot3-ctl) >"), 90);
        assert_eq!(driver.score("(lab) >"), 87);
        assert_eq!(driver.score("router#"), 0);
        assert!(driver.user_prompts()[0].is_match("User: "));
        assert!(driver.prompts()[0].is_match("\r\n(Cisco Controller) >"));
    }

    #[test]
    fn generic_driver_never_scores() {
        let driver = generic().expect("generic");
        assert_eq!(driver.score("User Access Verification\nrouter#"), 0);
        assert!(!driver.supports_os_guesser());
        assert!(driver.init_commands().is_empty());
    }

    #[test]
    fn cisco_banners_are_told_apart() {
        let ios = ios().expect("ios");
        let xr = ios_xr().expect("ios_xr");
        let nxos = nxos().expect("nxos");
        assert_eq!(ios.score("\r\nUser Access Verification\r\n\r\nUsername: "), 60);
        assert_eq!(xr.score("RP/0/RSP0/CPU0:pe1#"), 95);
        assert_eq!(nxos.score("Cisco Nexus Operating System (NX-OS) Software"), 88);
        assert!(ios.error_prompts().iter().any(|r| r.is_match("% Invalid input detected at '^' marker.")));
        assert!(ios.pager_prompts()[0].is_match("interface Gi0/1\n --More-- "));
    }

    #[test]
    fn vrp_and_junos_prompts_match() {
        let vrp = vrp().expect("vrp");
        assert!(vrp.prompts()[0].is_match("\r\n<core-1>"));
        assert!(vrp.prompts()[0].is_match("[~core-1]"));
        let junos = junos().expect("junos");
        assert!(junos.prompts()[0].is_match("\nadmin@mx960> "));
        assert_eq!(junos.score("--- JUNOS 21.4R1 built 2021-12-01"), 80);
    }
}
