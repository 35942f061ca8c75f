use regex::Regex;

/// What a single (trimmed) source line declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker<'a> {
    /// `namespace <dialect>.Plugins` for a foreign plugin host dialect.
    ForeignDialect,
    /// `// Requires: Name`
    Requires(&'a str),
    /// `// Reference: Name`
    Reference(&'a str),
    /// `using <Host>.(Core|Ext|Game).Name...;`
    Using(&'a str),
    /// `namespace <Host>.Plugins`
    PluginNamespace,
    /// Blank line, brace or `[Attribute]` line inside the plugin namespace.
    Filler,
    /// `class Name : ...Plugin` inside the plugin namespace.
    EntryPoint(&'a str),
    Other,
}

/// Table of line patterns recognized in script source.
///
/// All patterns are case-insensitive and built once per host namespace.
#[derive(Debug, Clone)]
pub struct MarkerTable {
    host: String,
    dialects: Vec<String>,
    requires: Regex,
    reference: Regex,
    using: Regex,
    namespace: Regex,
    filler: Regex,
    attribute: Regex,
    entry_point: Regex,
    library_name: Regex,
    extension_reference: Regex,
}

impl MarkerTable {
    pub fn new(host: &str, dialects: &[String]) -> Result<Self, regex::Error> {
        let escaped = regex::escape(host);
        Ok(Self {
            host: host.to_owned(),
            dialects: dialects
                .iter()
                .map(|dialect| format!("namespace {}.plugins", dialect.to_lowercase()))
                .collect(),
            requires: Regex::new(r"(?i)^//\s*Requires:\s*(\S+?)(\.cs)?\s*$")?,
            reference: Regex::new(r"(?i)^//\s*Reference:\s*(\S+)\s*$")?,
            using: Regex::new(&format!(
                r"(?i)^\s*using\s+({escaped}\.(?:Core|Ext|Game)\.(?:[^\.]+))[^;]*;.*$"
            ))?,
            namespace: Regex::new(&format!(r"(?i)^\s*namespace {escaped}\.Plugins\s*(\{{\s*)?$"))?,
            filler: Regex::new(r"^\s*\{?\s*$")?,
            attribute: Regex::new(r"^\s*\[")?,
            entry_point: Regex::new(
                r"(?i)^\s*(?:public|private|protected|internal)?\s*class\s+(\S+)\s+:\s+\S+Plugin\s*$",
            )?,
            library_name: Regex::new(&format!(r"{escaped}\.[\w]+\.([\w]+)"))?,
            extension_reference: Regex::new(&format!(r"(?i)^({escaped}\.(?:Ext|Game)\.(.+))$"))?,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Classify one trimmed line. `in_namespace` is set once the plugin
    /// namespace has been seen; only then are entry points recognized.
    pub fn classify<'a>(&self, line: &'a str, in_namespace: bool) -> Marker<'a> {
        let lowered = line.to_lowercase();
        if self.dialects.iter().any(|dialect| lowered.contains(dialect)) {
            return Marker::ForeignDialect;
        }

        if in_namespace {
            if self.filler.is_match(line) || self.attribute.is_match(line) {
                return Marker::Filler;
            }
            return match self.entry_point.captures(line).and_then(|caps| caps.get(1)) {
                Some(name) => Marker::EntryPoint(name.as_str()),
                None => Marker::Other,
            };
        }

        if let Some(name) = self.requires.captures(line).and_then(|caps| caps.get(1)) {
            return Marker::Requires(name.as_str());
        }
        if let Some(name) = self.reference.captures(line).and_then(|caps| caps.get(1)) {
            return Marker::Reference(name.as_str());
        }
        if let Some(name) = self.using.captures(line).and_then(|caps| caps.get(1)) {
            return Marker::Using(name.as_str());
        }
        if self.namespace.is_match(line) {
            return Marker::PluginNamespace;
        }
        Marker::Other
    }

    /// `Oxide.Ext.Discord` -> `Oxide.Discord`.
    pub fn library_name(&self, namespace: &str) -> String {
        self.library_name
            .replace_all(namespace, format!("{}.$1", self.host).as_str())
            .into_owned()
    }

    /// Splits `<Host>.(Ext|Game).Name` references into (full name, Name).
    pub fn extension_reference<'a>(&self, reference: &'a str) -> Option<(&'a str, &'a str)> {
        let caps = self.extension_reference.captures(reference)?;
        Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
    }
}
