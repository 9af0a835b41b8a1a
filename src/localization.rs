use anyhow::Result;
use fluent_bundle::concurrent::FluentBundle;
use fluent_bundle::{FluentArgs, FluentResource, FluentValue};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, OnceLock};
use unic_langid::LanguageIdentifier;

/// Localization manager for all user-visible bot text.
pub struct LocalizationManager {
    bundles: HashMap<String, Arc<FluentBundle<FluentResource>>>,
}

impl LocalizationManager {
    /// Create a new localization manager, loading every available locale.
    pub fn new() -> Result<Self> {
        let mut bundles = HashMap::new();

        let en_locale: LanguageIdentifier = "en".parse()?;
        let bundle = Self::create_bundle(&en_locale)?;
        bundles.insert("en".to_string(), Arc::new(bundle));

        Ok(Self { bundles })
    }

    fn empty() -> Self {
        Self {
            bundles: HashMap::new(),
        }
    }

    /// Create a fluent bundle for a locale from `./locales/<locale>/main.ftl`.
    fn create_bundle(locale: &LanguageIdentifier) -> Result<FluentBundle<FluentResource>> {
        let mut bundle = FluentBundle::new_concurrent(vec![locale.clone()]);

        let resource_path = format!("./locales/{}/main.ftl", locale);
        if let Ok(content) = fs::read_to_string(&resource_path) {
            if let Ok(resource) = FluentResource::try_new(content) {
                let _ = bundle.add_resource(resource);
            }
        }

        Ok(bundle)
    }

    /// Get a localized message, falling back to a marker string when the key
    /// or the whole bundle is missing.
    pub fn get_message(&self, key: &str, args: Option<&FluentArgs>) -> String {
        let bundle = match self.bundles.get("en") {
            Some(bundle) => bundle,
            None => return format!("Missing translation: {}", key),
        };

        let msg = match bundle.get_message(key) {
            Some(msg) => msg,
            None => return format!("Missing translation: {}", key),
        };

        let pattern = match msg.value() {
            Some(pattern) => pattern,
            None => return format!("Missing value for key: {}", key),
        };

        let mut errors = vec![];
        bundle
            .format_pattern(pattern, args, &mut errors)
            .into_owned()
    }
}

static LOCALIZATION_MANAGER: OnceLock<LocalizationManager> = OnceLock::new();

/// Initialize the global localization manager eagerly so a missing locale
/// directory is reported at startup rather than at first lookup.
pub fn init_localization() -> Result<()> {
    let manager = LocalizationManager::new()?;
    let _ = LOCALIZATION_MANAGER.set(manager);
    Ok(())
}

fn manager() -> &'static LocalizationManager {
    LOCALIZATION_MANAGER
        .get_or_init(|| LocalizationManager::new().unwrap_or_else(|_| LocalizationManager::empty()))
}

/// Get a localized message by key.
pub fn t(key: &str) -> String {
    manager().get_message(key, None)
}

/// Get a localized message with arguments.
pub fn t_args(key: &str, args: &[(&str, &str)]) -> String {
    let mut fluent_args = FluentArgs::new();
    for (name, value) in args {
        fluent_args.set(*name, FluentValue::from(*value));
    }
    manager().get_message(key, Some(&fluent_args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_yields_marker() {
        let manager = LocalizationManager::empty();
        assert_eq!(
            manager.get_message("no-such-key", None),
            "Missing translation: no-such-key"
        );
    }

    #[test]
    fn lookup_never_panics_without_locales() {
        let text = t("definitely-not-a-key");
        assert!(text.contains("definitely-not-a-key"));
    }
}
