#![forbid(unsafe_code)]

mod error;
mod image;
mod reader;
mod writer;

pub use crate::error::{Error, Result};
pub use crate::image::{
    flags, EventDef, FieldDef, MethodDef, ModuleImage, PropertyDef, TypeDef, Visibility,
    MAX_NESTING_DEPTH, MODULE_MAGIC, MODULE_VERSION,
};
pub use crate::reader::Reader;
pub use crate::writer::Writer;
