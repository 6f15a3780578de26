use super::*;

use crate::templates;

/// Ordered set of drivers queried by banner score.
///
/// Registration order is significant: when two drivers give a banner the
/// same score, the one registered first wins.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
    fallback: Arc<dyn Driver>,
    threshold: u8,
}

impl DriverRegistry {
    /// Creates a registry with no drivers besides the generic fallback.
    pub fn new() -> Result<Self, FleetError> {
        Ok(Self {
            drivers: Vec::new(),
            fallback: Arc::new(templates::generic()?),
            threshold: DEFAULT_DRIVER_THRESHOLD,
        })
    }

    /// Creates a registry holding every built-in driver.
    pub fn with_builtin_drivers() -> Result<Self, FleetError> {
        let mut registry = Self::new()?;
        for name in templates::available_drivers() {
            registry.register(Arc::new(templates::by_name(name)?))?;
        }
        Ok(registry)
    }

    /// Scores at or below `threshold` select the fallback driver.
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Adds a driver after all registered ones.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<(), FleetError> {
        if self.drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(FleetError::DriverAlreadyRegistered(driver.name().to_string()));
        }
        debug!("Registering driver '{}'", driver.name());
        if driver.name() == GENERIC_DRIVER {
            self.fallback = driver.clone();
        }
        self.drivers.push(driver);
        Ok(())
    }

    /// Looks up a driver by name.
    ///
    /// The generic driver is always available, registered or not.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, FleetError> {
        if let Some(driver) = self.drivers.iter().find(|d| d.name() == name) {
            return Ok(driver.clone());
        }
        if name == GENERIC_DRIVER {
            return Ok(self.fallback.clone());
        }
        Err(FleetError::DriverNotFound(name.to_string()))
    }

    /// The driver used when nothing scores above the threshold.
    pub fn fallback(&self) -> Arc<dyn Driver> {
        self.fallback.clone()
    }

    /// Every driver with its score, best first, ties in registration order.
    pub fn ranked(&self, banner: &str) -> Vec<(Arc<dyn Driver>, u8)> {
        let mut ranked: Vec<_> = self
            .drivers
            .iter()
            .map(|driver| (driver.clone(), driver.score(banner)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    /// The best scoring driver, or [`FleetError::DriverMismatch`] when no
    /// driver scores above the threshold.
    pub fn try_best_match(&self, banner: &str) -> Result<Arc<dyn Driver>, FleetError> {
        match self.ranked(banner).into_iter().next() {
            Some((driver, score)) if score > self.threshold => {
                trace!("Driver '{}' scored {} on banner", driver.name(), score);
                Ok(driver)
            }
            _ => Err(FleetError::DriverMismatch(banner.lines().last().unwrap_or_default().to_string())),
        }
    }

    /// The best scoring driver, falling back to the generic one.
    pub fn best_match(&self, banner: &str) -> Arc<dyn Driver> {
        self.try_best_match(banner).unwrap_or_else(|err| {
            debug!("{err}; using '{}'", self.fallback.name());
            self.fallback.clone()
        })
    }

    /// Names of the registered drivers in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.iter()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(name: &str, pattern: &str, score: u8) -> Arc<dyn Driver> {
        DriverBuilder::new(name)
            .score_rule(pattern, score)
            .build_shared()
            .expect("build driver")
    }

    #[test]
    fn highest_score_wins() {
        let mut registry = DriverRegistry::new().expect("registry");
        registry.register(scored("low", "banner", 10)).expect("register");
        registry.register(scored("high", "banner", 60)).expect("register");
        assert_eq!(registry.best_match("some banner").name(), "high");
    }

    #[test]
    fn ties_go_to_the_first_registered_driver() {
        let mut registry = DriverRegistry::new().expect("registry");
        registry.register(scored("first", "x", 50)).expect("register");
        registry.register(scored("second", "x", 50)).expect("register");
        assert_eq!(registry.best_match("x").name(), "first");
        let names: Vec<_> = registry
            .ranked("x")
            .into_iter()
            .map(|(d, _)| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn no_match_falls_back_to_generic() {
        let mut registry = DriverRegistry::new().expect("registry").with_threshold(20);
        registry.register(scored("weak", "x", 20)).expect("register");
        assert!(matches!(
            registry.try_best_match("x"),
            Err(FleetError::DriverMismatch(_))
        ));
        assert_eq!(registry.best_match("x").name(), GENERIC_DRIVER);
        assert_eq!(registry.best_match("").name(), GENERIC_DRIVER);
    }

    #[test]
    fn duplicate_and_missing_names_are_errors() {
        let mut registry = DriverRegistry::new().expect("registry");
        registry.register(scored("a", "x", 1)).expect("register");
        assert!(matches!(
            registry.register(scored("a", "y", 2)),
            Err(FleetError::DriverAlreadyRegistered(_))
        ));
        assert!(matches!(
            registry.get("zzz"),
            Err(FleetError::DriverNotFound(_))
        ));
        assert_eq!(registry.get(GENERIC_DRIVER).expect("generic").name(), GENERIC_DRIVER);
    }

    #[test]
    fn builtin_registry_recognizes_vendor_banners() {
        let registry = DriverRegistry::with_builtin_drivers().expect("registry");
        assert_eq!(registry.names()[0], GENERIC_DRIVER);
        assert_eq!(
            registry.best_match("\r\n(Cisco Controller) >").name(),
            "aironet"
        );
        assert_eq!(
            registry
                .best_match("RP/0/RSP0/CPU0:edge-1#")
                .name(),
            "ios_xr"
        );
        assert_eq!(
            registry
                .best_match("Huawei Versatile Routing Platform Software\n<core-1>")
                .name(),
            "vrp"
        );
        assert_eq!(registry.best_match("Welcome to r1!\nUser: ").name(), GENERIC_DRIVER);
    }
}
