//! Extractive app list, forbidden URL patterns and the blocker switch.
//!
//! All three live in the store's settings row; a running daemon is asked to
//! reload after every change.

use anyhow::Result;
use rewire_storage::{Database, Settings};
use std::path::Path;

use super::daemon::notify_settings_changed;
use super::helpers::truncate_str;
use crate::ListAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Apps,
    Urls,
}

impl ListKind {
    fn entries(self, settings: &mut Settings) -> &mut Vec<String> {
        match self {
            Self::Apps => &mut settings.extractive_apps,
            Self::Urls => &mut settings.forbidden_urls,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Apps => "Extractive apps",
            Self::Urls => "Forbidden URL patterns",
        }
    }

    /// Package names are case-sensitive; URL patterns match lowercased URLs
    fn normalize(self, entry: &str) -> String {
        match self {
            Self::Apps => entry.trim().to_string(),
            Self::Urls => entry.trim().to_lowercase(),
        }
    }
}

/// Apply `action` to one list. Returns whether the settings changed.
fn apply(settings: &mut Settings, kind: ListKind, action: &ListAction) -> Result<bool> {
    let entries = kind.entries(settings);
    match action {
        ListAction::Add { entry } => {
            let entry = kind.normalize(entry);
            if entry.is_empty() {
                anyhow::bail!("Refusing to add an empty entry");
            }
            if entries.contains(&entry) {
                println!("{entry} is already listed");
                return Ok(false);
            }
            println!("Added {entry}");
            entries.push(entry);
            Ok(true)
        }
        ListAction::Remove { entry } => {
            let entry = kind.normalize(entry);
            let before = entries.len();
            entries.retain(|e| *e != entry);
            if entries.len() == before {
                println!("{entry} was not listed");
                return Ok(false);
            }
            println!("Removed {entry}");
            Ok(true)
        }
        ListAction::List => {
            println!("{}:", kind.label());
            if entries.is_empty() {
                println!("  (none)");
            }
            for entry in entries.iter() {
                println!("  {}", truncate_str(entry, 60));
            }
            Ok(false)
        }
    }
}

async fn handle_list(data_dir: &Path, kind: ListKind, action: ListAction) -> Result<()> {
    let db = Database::new(None)?;
    let mut settings = db.get_settings()?;
    if apply(&mut settings, kind, &action)? {
        db.update_settings(&settings)?;
        notify_settings_changed(data_dir).await;
    }
    Ok(())
}

pub async fn handle_apps_command(data_dir: &Path, action: ListAction) -> Result<()> {
    handle_list(data_dir, ListKind::Apps, action).await
}

pub async fn handle_urls_command(data_dir: &Path, action: ListAction) -> Result<()> {
    handle_list(data_dir, ListKind::Urls, action).await
}

pub async fn handle_blocker_command(data_dir: &Path, active: bool) -> Result<()> {
    let db = Database::new(None)?;
    let mut settings = db.get_settings()?;
    if settings.blocker_active == active {
        println!("Blocker is already {}", if active { "on" } else { "off" });
        return Ok(());
    }
    settings.blocker_active = active;
    db.update_settings(&settings)?;
    println!("Blocker switched {}", if active { "on" } else { "off" });
    notify_settings_changed(data_dir).await;
    Ok(())
}
