use crate::error::{Error, Result};

#[derive(Default)]
pub struct Writer {
    out: Vec<u8>,
}

impl Writer {
    pub fn write_u1(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn write_u2(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u4(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_count(&mut self, len: usize, what: &'static str) -> Result<()> {
        let len = u16::try_from(len).map_err(|_| Error::TooLarge(what))?;
        self.write_u2(len);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8], what: &'static str) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::TooLarge(what))?;
        self.write_u4(len);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_count(value.len(), "string")?;
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_opt_string(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            None => {
                self.write_u1(0);
                Ok(())
            }
            Some(value) => {
                self.write_u1(1);
                self.write_string(value)
            }
        }
    }

    pub fn write_strings(&mut self, values: &[String], what: &'static str) -> Result<()> {
        self.write_count(values.len(), what)?;
        for value in values {
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}
