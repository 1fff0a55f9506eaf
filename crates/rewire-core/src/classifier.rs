//! Turns raw window events into firewall signals.
//!
//! Priority: transient noise > foreground change > URL commit > irrelevant.
//! Ambiguity (unknown package, no address bar) is never treated as forbidden.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::RegexSet;
use rewire_storage::Settings;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::ClassifierConfig;
use crate::node::UiNode;


/// Package-name fragments of system overlays, input methods and launchers
const NOISE_HEURISTICS: [&str; 13] = [
    r"^android$",
    r"systemui",
    r"statusbar",
    r"notification",
    r"quicksettings",
    r"permissioncontroller",
    r"inputmethod",
    r"keyboard",
    r"(^|\.)(latin|ime)(\.|$)",
    r"launcher",
    r"trebuchet",
    r"(^|\.)home(\.|$)",
    r"miui\.home",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WindowStateChanged,
    WindowContentChanged,
    ViewScrolled,
}

/// Text already extracted from a browser's address bar by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBar {
    pub text: String,
    #[serde(default)]
    pub focused: bool,
}

/// One notification from the event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub package: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_bar: Option<AddressBar>,
    /// Window tree, searched for the address bar when `address_bar` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<UiNode>,
}

impl RawEvent {
    #[must_use]
    pub fn new(package: impl Into<String>, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            package: package.into(),
            kind,
            timestamp,
            address_bar: None,
            root: None,
        }
    }

    #[must_use]
    pub fn with_address_bar(mut self, text: impl Into<String>, focused: bool) -> Self {
        self.address_bar = Some(AddressBar {
            text: text.into(),
            focused,
        });
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: UiNode) -> Self {
        self.root = Some(root);
        self
    }
}

/// Classification result consumed by the session tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A configured extractive app became the foreground
    ForegroundExtractive(String),
    /// Any other real app became the foreground
    ForegroundOther(String),
    ForbiddenUrlCommitted { package: String, pattern: String },
    /// A stable, committed URL that matches no forbidden pattern
    SafeUrlConfirmed(String),
    TransientNoise,
    Irrelevant,
}

#[derive(Debug, Clone)]
struct ForegroundChange {
    package: String,
    at: DateTime<Utc>,
}

/// Last address-bar value seen for one browser
#[derive(Debug, Clone)]
struct UrlObservation {
    url: String,
    changed_at: DateTime<Utc>,
}

pub struct EventClassifier {
    config: ClassifierConfig,
    heuristics: RegexSet,
    noise_packages: HashSet<String>,
    extractive_apps: HashSet<String>,
    /// Lowercased, trimmed, non-empty
    forbidden_patterns: Vec<String>,
    foreground: Option<ForegroundChange>,
    urls: HashMap<String, UrlObservation>,
}

impl EventClassifier {
    /// Build a classifier with the given tunables and user lists
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in noise heuristics fail to compile
    pub fn new(config: ClassifierConfig, settings: &Settings) -> Result<Self> {
        let heuristics =
            RegexSet::new(NOISE_HEURISTICS).context("Failed to compile noise heuristics")?;
        let noise_packages = config
            .transient_packages
            .iter()
            .chain(&config.launcher_packages)
            .chain(std::iter::once(&config.own_package))
            .cloned()
            .collect();

        let mut classifier = Self {
            config,
            heuristics,
            noise_packages,
            extractive_apps: HashSet::new(),
            forbidden_patterns: Vec::new(),
            foreground: None,
            urls: HashMap::new(),
        };
        classifier.apply_settings(settings);
        Ok(classifier)
    }

    /// Swap in the user's extractive app and forbidden URL lists
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.extractive_apps = settings.extractive_apps.iter().cloned().collect();
        self.forbidden_patterns = settings
            .forbidden_urls
            .iter()
            .map(|pattern| pattern.trim().to_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        log::info!(
            "Classifier loaded {} extractive apps, {} URL patterns",
            self.extractive_apps.len(),
            self.forbidden_patterns.len()
        );
    }

    /// Own app, launchers, input methods and system overlays
    #[must_use]
    pub fn is_transient(&self, package: &str) -> bool {
        self.noise_packages.contains(package) || self.heuristics.is_match(&package.to_lowercase())
    }

    #[must_use]
    pub fn is_extractive(&self, package: &str) -> bool {
        self.extractive_apps.contains(package)
    }

    /// First forbidden pattern contained in `url`
    #[must_use]
    pub fn match_pattern(&self, url: &str) -> Option<&str> {
        let url = url.trim().to_lowercase();
        self.forbidden_patterns
            .iter()
            .find(|pattern| url.contains(pattern.as_str()))
            .map(String::as_str)
    }

    /// Package most recently accepted as foreground
    #[must_use]
    pub fn foreground(&self) -> Option<&str> {
        self.foreground.as_ref().map(|change| change.package.as_str())
    }

    /// Classify one raw event. Returns at least one signal.
    pub fn classify(&mut self, event: &RawEvent) -> Vec<Signal> {
        if self.is_transient(&event.package) {
            // Launchers and overlays still count as leaving the previous app,
            // so returning to it is seen as a fresh foreground change. The
            // firewall's own gate UI does not.
            if event.package != self.config.own_package {
                self.accept_foreground(&event.package, event.timestamp);
            }
            log::debug!("'{}' is transient noise", event.package);
            return vec![Signal::TransientNoise];
        }

        let mut signals = Vec::new();
        if self.accept_foreground(&event.package, event.timestamp) {
            if self.is_extractive(&event.package) {
                signals.push(Signal::ForegroundExtractive(event.package.clone()));
            } else {
                signals.push(Signal::ForegroundOther(event.package.clone()));
            }
        }
        if let Some(signal) = self.observe_url(event) {
            signals.push(signal);
        }

        if signals.is_empty() {
            signals.push(Signal::Irrelevant);
        }
        signals
    }

    /// Debounced foreground tracking: a different package is accepted only
    /// once `foreground_debounce_ms` has passed since the last accepted change.
    /// Events stamped before that change are stale redeliveries and ignored.
    fn accept_foreground(&mut self, package: &str, at: DateTime<Utc>) -> bool {
        if let Some(last) = &self.foreground {
            if last.package == package {
                return false;
            }
            let elapsed = (at - last.at).num_milliseconds();
            if elapsed < 0 {
                log::debug!("Ignoring stale foreground '{package}' from {}ms ago", -elapsed);
                return false;
            }
            if elapsed < self.config.foreground_debounce_ms {
                log::debug!("Debounced foreground flicker to '{package}' after {elapsed}ms");
                return false;
            }
        }
        log::debug!("Foreground is now '{package}'");
        self.foreground = Some(ForegroundChange {
            package: package.to_string(),
            at,
        });
        true
    }

    fn observe_url(&mut self, event: &RawEvent) -> Option<Signal> {
        if event.kind == EventKind::ViewScrolled {
            return None;
        }
        let browser = self
            .config
            .browsers
            .iter()
            .find(|browser| browser.package == event.package)?;
        let bar = event.address_bar.clone().or_else(|| {
            let node = event
                .root
                .as_ref()?
                .find_address_bar(&browser.address_bar_ids)?;
            Some(AddressBar {
                text: node.text.clone()?,
                focused: node.focused,
            })
        })?;

        let url = bar.text.trim().to_lowercase();
        if url.is_empty() {
            return None;
        }

        let now = event.timestamp;
        let unchanged_since = self
            .urls
            .get(&event.package)
            .filter(|seen| seen.url == url)
            .map(|seen| seen.changed_at);
        let Some(changed_at) = unchanged_since else {
            // Any change restarts the stability window
            self.urls.insert(
                event.package.clone(),
                UrlObservation {
                    url,
                    changed_at: now,
                },
            );
            return None;
        };

        if (now - changed_at).num_milliseconds() < self.config.url_stable_ms {
            return None;
        }
        let committed = !bar.focused || event.kind == EventKind::WindowStateChanged;
        if !committed {
            return None;
        }

        match self.match_pattern(&url).map(str::to_string) {
            Some(pattern) => {
                log::debug!("'{}' committed forbidden url matching '{pattern}'", event.package);
                Some(Signal::ForbiddenUrlCommitted {
                    package: event.package.clone(),
                    pattern,
                })
            }
            None => {
                // The next url has to prove itself stable from scratch
                self.urls.remove(&event.package);
                Some(Signal::SafeUrlConfirmed(event.package.clone()))
            }
        }
    }
}
