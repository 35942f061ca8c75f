use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::writer::Writer;

pub const MODULE_MAGIC: u32 = 0x4B4D_4F44; // "KMOD"
pub const MODULE_VERSION: u16 = 1;
/// Deepest chain of nested types a module image may carry.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Access and shape flags shared by types and members.
pub mod flags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const INTERNAL: u16 = 0x0008;
    pub const STATIC: u16 = 0x0010;
    /// Runtime-significant name (accessors, constructors, operators).
    pub const SPECIAL_NAME: u16 = 0x0020;
    pub const CONSTRUCTOR: u16 = 0x0040;
    pub const ABSTRACT: u16 = 0x0080;
    /// Type flag: declared inside another type.
    pub const NESTED: u16 = 0x0100;

    pub const VISIBILITY_MASK: u16 = PUBLIC | PRIVATE | PROTECTED | INTERNAL;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
    Internal,
}

impl Visibility {
    pub fn from_flags(value: u16) -> Self {
        match value & flags::VISIBILITY_MASK {
            flags::PUBLIC => Visibility::Public,
            flags::PROTECTED => Visibility::Protected,
            flags::INTERNAL => Visibility::Internal,
            _ => Visibility::Private,
        }
    }

    fn bits(self) -> u16 {
        match self {
            Visibility::Public => flags::PUBLIC,
            Visibility::Private => flags::PRIVATE,
            Visibility::Protected => flags::PROTECTED,
            Visibility::Internal => flags::INTERNAL,
        }
    }

    pub fn apply(self, value: u16) -> u16 {
        (value & !flags::VISIBILITY_MASK) | self.bits()
    }
}

/// A compiled module: the unit of output of one build session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub name: String,
    pub references: Vec<String>,
    pub types: Vec<TypeDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub flags: u16,
    pub base: Option<String>,
    pub attributes: Vec<String>,
    pub fields: Vec<FieldDef>,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<MethodDef>,
    pub events: Vec<EventDef>,
    pub nested: Vec<TypeDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub flags: u16,
    pub field_type: String,
    pub attributes: Vec<String>,
}

/// A property; accessors are methods of the declaring type, referenced by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub property_type: String,
    pub getter: Option<String>,
    pub setter: Option<String>,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub flags: u16,
    pub params: Vec<String>,
    pub return_type: String,
    pub attributes: Vec<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    pub name: String,
    pub event_type: String,
    pub add: Option<String>,
    pub remove: Option<String>,
    pub attributes: Vec<String>,
}

impl ModuleImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            references: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_u4()?;
        if magic != MODULE_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = reader.read_u2()?;
        if version != MODULE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let name = reader.read_string()?;
        let references = reader.read_strings()?;
        let types = parse_types(&mut reader, 0)?;

        reader.ensure_empty()?;

        Ok(Self {
            name,
            references,
            types,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::default();
        writer.write_u4(MODULE_MAGIC);
        writer.write_u2(MODULE_VERSION);
        writer.write_string(&self.name)?;
        writer.write_strings(&self.references, "reference list")?;
        write_types(&mut writer, &self.types, 0)?;
        Ok(writer.finish())
    }

    /// Finds a top-level type by namespace and name.
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<&TypeDef> {
        self.types
            .iter()
            .find(|ty| ty.namespace == namespace && ty.name == name)
    }
}

impl TypeDef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, flags: u16) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            flags,
            base: None,
            attributes: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            events: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_flags(self.flags)
    }

    pub fn is_nested(&self) -> bool {
        self.flags & flags::NESTED != 0
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_mut(&mut self, name: &str) -> Option<&mut MethodDef> {
        self.methods.iter_mut().find(|m| m.name == name)
    }
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>, flags: u16) -> Self {
        Self {
            name: name.into(),
            flags,
            field_type: field_type.into(),
            attributes: Vec::new(),
        }
    }
}

impl MethodDef {
    pub fn new(name: impl Into<String>, flags: u16) -> Self {
        Self {
            name: name.into(),
            flags,
            params: Vec::new(),
            return_type: "void".to_owned(),
            attributes: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_flags(self.flags)
    }

    pub fn is_static(&self) -> bool {
        self.flags & flags::STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.flags & flags::CONSTRUCTOR != 0
    }

    pub fn is_special_name(&self) -> bool {
        self.flags & flags::SPECIAL_NAME != 0
    }
}

fn parse_types(reader: &mut Reader<'_>, depth: usize) -> Result<Vec<TypeDef>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::TooDeep(MAX_NESTING_DEPTH));
    }
    let count = reader.read_u2()? as usize;
    let mut types = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        types.push(parse_type(reader, depth)?);
    }
    Ok(types)
}

fn parse_type(reader: &mut Reader<'_>, depth: usize) -> Result<TypeDef> {
    let namespace = reader.read_string()?;
    let name = reader.read_string()?;
    let flags = reader.read_u2()?;
    let base = reader.read_opt_string()?;
    let attributes = reader.read_strings()?;

    let field_count = reader.read_u2()? as usize;
    let mut fields = Vec::with_capacity(field_count.min(reader.remaining()));
    for _ in 0..field_count {
        fields.push(FieldDef {
            name: reader.read_string()?,
            flags: reader.read_u2()?,
            field_type: reader.read_string()?,
            attributes: reader.read_strings()?,
        });
    }

    let property_count = reader.read_u2()? as usize;
    let mut properties = Vec::with_capacity(property_count.min(reader.remaining()));
    for _ in 0..property_count {
        properties.push(PropertyDef {
            name: reader.read_string()?,
            property_type: reader.read_string()?,
            getter: reader.read_opt_string()?,
            setter: reader.read_opt_string()?,
            attributes: reader.read_strings()?,
        });
    }

    let method_count = reader.read_u2()? as usize;
    let mut methods = Vec::with_capacity(method_count.min(reader.remaining()));
    for _ in 0..method_count {
        let name = reader.read_string()?;
        let flags = reader.read_u2()?;
        let params = reader.read_strings()?;
        let return_type = reader.read_string()?;
        let attributes = reader.read_strings()?;
        let body_len = reader.read_u4()? as usize;
        let body = reader.read_bytes(body_len)?.to_vec();
        methods.push(MethodDef {
            name,
            flags,
            params,
            return_type,
            attributes,
            body,
        });
    }

    let event_count = reader.read_u2()? as usize;
    let mut events = Vec::with_capacity(event_count.min(reader.remaining()));
    for _ in 0..event_count {
        events.push(EventDef {
            name: reader.read_string()?,
            event_type: reader.read_string()?,
            add: reader.read_opt_string()?,
            remove: reader.read_opt_string()?,
            attributes: reader.read_strings()?,
        });
    }

    let nested = parse_types(reader, depth + 1)?;

    Ok(TypeDef {
        namespace,
        name,
        flags,
        base,
        attributes,
        fields,
        properties,
        methods,
        events,
        nested,
    })
}

fn write_types(writer: &mut Writer, types: &[TypeDef], depth: usize) -> Result<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::TooDeep(MAX_NESTING_DEPTH));
    }
    writer.write_count(types.len(), "type list")?;
    for ty in types {
        write_type(writer, ty, depth)?;
    }
    Ok(())
}

fn write_type(writer: &mut Writer, ty: &TypeDef, depth: usize) -> Result<()> {
    writer.write_string(&ty.namespace)?;
    writer.write_string(&ty.name)?;
    writer.write_u2(ty.flags);
    writer.write_opt_string(ty.base.as_deref())?;
    writer.write_strings(&ty.attributes, "attribute list")?;

    writer.write_count(ty.fields.len(), "field list")?;
    for field in &ty.fields {
        writer.write_string(&field.name)?;
        writer.write_u2(field.flags);
        writer.write_string(&field.field_type)?;
        writer.write_strings(&field.attributes, "attribute list")?;
    }

    writer.write_count(ty.properties.len(), "property list")?;
    for property in &ty.properties {
        writer.write_string(&property.name)?;
        writer.write_string(&property.property_type)?;
        writer.write_opt_string(property.getter.as_deref())?;
        writer.write_opt_string(property.setter.as_deref())?;
        writer.write_strings(&property.attributes, "attribute list")?;
    }

    writer.write_count(ty.methods.len(), "method list")?;
    for method in &ty.methods {
        writer.write_string(&method.name)?;
        writer.write_u2(method.flags);
        writer.write_strings(&method.params, "parameter list")?;
        writer.write_string(&method.return_type)?;
        writer.write_strings(&method.attributes, "attribute list")?;
        writer.write_bytes(&method.body, "method body")?;
    }

    writer.write_count(ty.events.len(), "event list")?;
    for event in &ty.events {
        writer.write_string(&event.name)?;
        writer.write_string(&event.event_type)?;
        writer.write_opt_string(event.add.as_deref())?;
        writer.write_opt_string(event.remove.as_deref())?;
        writer.write_strings(&event.attributes, "attribute list")?;
    }

    write_types(writer, &ty.nested, depth + 1)
}
