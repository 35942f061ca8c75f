use regex::Regex;

use kiln_module::Visibility;

use crate::element::Element;
use crate::pipeline::PassContext;

#[derive(Debug, Clone)]
pub enum NamePattern {
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Equals(String),
    Regex(Regex),
}

impl NamePattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            NamePattern::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            NamePattern::EndsWith(suffix) => value.ends_with(suffix.as_str()),
            NamePattern::Contains(needle) => value.contains(needle.as_str()),
            NamePattern::Equals(name) => value == name,
            NamePattern::Regex(re) => re.is_match(value),
        }
    }
}

/// Applicability check evaluated against one visited element.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Element name matches (or, with `inverse`, does not match) the pattern.
    Name { pattern: NamePattern, inverse: bool },
    /// Namespace of the declaring type matches the pattern.
    Namespace { pattern: NamePattern, inverse: bool },
    /// Marker attribute is present (`present: true`) or absent.
    Attribute { name: String, present: bool },
    /// Element is public (or not), optionally also requiring static-ness.
    Visibility { public: bool, is_static: Option<bool> },
    SkipSpecialName,
    /// Element name is not in the configured list.
    NotIgnored(Vec<String>),
    /// Type name is one of the units being built.
    UnitEntryPoint,
}

impl Predicate {
    pub fn accepts(&self, element: &Element<'_>, cx: &PassContext<'_>) -> bool {
        match self {
            Predicate::Name { pattern, inverse } => pattern.matches(element.name()) != *inverse,
            Predicate::Namespace { pattern, inverse } => {
                pattern.matches(element.namespace()) != *inverse
            }
            Predicate::Attribute { name, present } => element.has_attribute(name) == *present,
            Predicate::Visibility { public, is_static } => {
                (element.visibility() == Visibility::Public) == *public
                    && is_static.map_or(true, |wanted| element.is_static() == wanted)
            }
            Predicate::SkipSpecialName => !element.is_special_name(),
            Predicate::NotIgnored(names) => !names.iter().any(|name| name == element.name()),
            Predicate::UnitEntryPoint => cx.units.iter().any(|unit| unit == element.name()),
        }
    }
}

/// Applicability check evaluated once per module, before traversal.
#[derive(Debug, Clone)]
pub enum ModulePredicate {
    Name { pattern: NamePattern, inverse: bool },
    /// Opt-in switch captured from configuration.
    Switch { name: &'static str, enabled: bool },
}

impl ModulePredicate {
    pub fn accepts(&self, module_name: &str) -> bool {
        match self {
            ModulePredicate::Name { pattern, inverse } => pattern.matches(module_name) != *inverse,
            ModulePredicate::Switch { enabled, .. } => *enabled,
        }
    }

    /// The module must not start with any of `prefixes`.
    pub fn deny_prefixes<'a>(prefixes: impl IntoIterator<Item = &'a String>) -> Vec<Self> {
        prefixes
            .into_iter()
            .map(|prefix| ModulePredicate::Name {
                pattern: NamePattern::StartsWith(prefix.clone()),
                inverse: true,
            })
            .collect()
    }
}
