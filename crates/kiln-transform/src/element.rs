use kiln_module::{flags, TypeDef, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Type,
    Property,
    Field,
    Method,
    Event,
}

/// Member addressed by index within its declaring type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Type,
    Property(usize),
    Field(usize),
    Method(usize),
    Event(usize),
}

/// A code element visited by the pipeline.
///
/// Members borrow their declaring type mutably so a rewrite can reach related
/// members (property and event accessors are methods of the same type).
pub struct Element<'a> {
    pub ty: &'a mut TypeDef,
    pub target: Target,
}

impl<'a> Element<'a> {
    pub fn new(ty: &'a mut TypeDef, target: Target) -> Self {
        Self { ty, target }
    }

    pub fn kind(&self) -> ElementKind {
        match self.target {
            Target::Type => ElementKind::Type,
            Target::Property(_) => ElementKind::Property,
            Target::Field(_) => ElementKind::Field,
            Target::Method(_) => ElementKind::Method,
            Target::Event(_) => ElementKind::Event,
        }
    }

    pub fn name(&self) -> &str {
        match self.target {
            Target::Type => &self.ty.name,
            Target::Property(i) => &self.ty.properties[i].name,
            Target::Field(i) => &self.ty.fields[i].name,
            Target::Method(i) => &self.ty.methods[i].name,
            Target::Event(i) => &self.ty.events[i].name,
        }
    }

    /// Namespace of the declaring type.
    pub fn namespace(&self) -> &str {
        &self.ty.namespace
    }

    pub fn attributes(&self) -> &[String] {
        match self.target {
            Target::Type => &self.ty.attributes,
            Target::Property(i) => &self.ty.properties[i].attributes,
            Target::Field(i) => &self.ty.fields[i].attributes,
            Target::Method(i) => &self.ty.methods[i].attributes,
            Target::Event(i) => &self.ty.events[i].attributes,
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes()
            .iter()
            .any(|attr| attribute_matches(attr, name))
    }

    /// Properties and events are public only when every accessor is.
    pub fn visibility(&self) -> Visibility {
        match self.target {
            Target::Type => self.ty.visibility(),
            Target::Field(i) => Visibility::from_flags(self.ty.fields[i].flags),
            Target::Method(i) => self.ty.methods[i].visibility(),
            Target::Property(i) => {
                let property = &self.ty.properties[i];
                self.accessor_visibility([property.getter.as_deref(), property.setter.as_deref()])
            }
            Target::Event(i) => {
                let event = &self.ty.events[i];
                self.accessor_visibility([event.add.as_deref(), event.remove.as_deref()])
            }
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags().is_some_and(|value| value & flags::STATIC != 0)
    }

    pub fn is_special_name(&self) -> bool {
        self.flags()
            .is_some_and(|value| value & flags::SPECIAL_NAME != 0)
    }

    /// Raw flags, for elements that carry their own.
    pub fn flags(&self) -> Option<u16> {
        match self.target {
            Target::Type => Some(self.ty.flags),
            Target::Field(i) => Some(self.ty.fields[i].flags),
            Target::Method(i) => Some(self.ty.methods[i].flags),
            Target::Property(_) | Target::Event(_) => None,
        }
    }

    fn accessor_visibility<const N: usize>(&self, accessors: [Option<&str>; N]) -> Visibility {
        accessors
            .into_iter()
            .flatten()
            .filter_map(|name| self.ty.method(name))
            .map(|method| method.visibility())
            .find(|visibility| *visibility != Visibility::Public)
            .unwrap_or(Visibility::Public)
    }
}

/// `Foo` matches `Foo`, `FooAttribute` and any namespace-qualified form of either.
pub(crate) fn attribute_matches(attribute: &str, name: &str) -> bool {
    let short = attribute.rsplit('.').next().unwrap_or(attribute);
    let short = short.strip_suffix("Attribute").unwrap_or(short);
    let wanted = name.rsplit('.').next().unwrap_or(name);
    let wanted = wanted.strip_suffix("Attribute").unwrap_or(wanted);
    short == wanted
}
