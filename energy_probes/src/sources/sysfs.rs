use std::{
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;

use crate::counter::{PowerProbe, PowerSample};

/// Reads a small sysfs file and trims the trailing newline.
pub(crate) fn read_trimmed(path: &Path) -> anyhow::Result<String> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    Ok(content.trim_end().to_owned())
}

/// Reads and parses a small sysfs file.
pub(crate) fn read_parsed<T>(path: &Path) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let content = read_trimmed(path)?;
    content
        .parse()
        .with_context(|| format!("Failed to parse {path:?}: '{content}'"))
}

/// A sysfs file that holds a number, kept open and re-read from the start on every poll.
pub(crate) struct ValueFile {
    path: PathBuf,
    file: File,
    // the content never exceeds a few bytes, reuse the allocation
    buf: Vec<u8>,
}

impl ValueFile {
    pub fn open(path: PathBuf) -> anyhow::Result<ValueFile> {
        let file = File::open(&path).with_context(|| format!("open {}", path.to_string_lossy()))?;
        Ok(ValueFile {
            path,
            file,
            buf: Vec::with_capacity(24),
        })
    }

    pub fn read<T>(&mut self) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        // read the file from the beginning
        self.buf.clear();
        self.file.rewind()?;
        self.file.read_to_end(&mut self.buf)?;

        let content = std::str::from_utf8(&self.buf)?;
        content
            .trim_end()
            .parse()
            .with_context(|| format!("failed to parse {:?}: '{content}'", self.path))
    }
}

/// A power sensor file whose integer content, multiplied by `scale`, gives Watts.
pub(crate) struct PowerFile {
    file: ValueFile,
    scale: f64,
}

impl PowerFile {
    pub fn open(path: PathBuf, scale: f64) -> anyhow::Result<PowerFile> {
        Ok(PowerFile {
            file: ValueFile::open(path)?,
            scale,
        })
    }
}

impl PowerProbe for PowerFile {
    fn read_power(&mut self) -> anyhow::Result<PowerSample> {
        let raw: i64 = self.file.read()?;
        Ok(PowerSample::now(raw as f64 * self.scale))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn value_file_sees_updates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("energy_uj");
        fs::write(&path, "123\n")?;

        let mut file = ValueFile::open(path.clone())?;
        assert_eq!(file.read::<u64>()?, 123);
        fs::write(&path, "45678\n")?;
        assert_eq!(file.read::<u64>()?, 45678);
        fs::write(&path, "oops\n")?;
        assert!(file.read::<u64>().is_err());
        Ok(())
    }

    #[test]
    fn power_file_applies_the_scale() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("power1_input");
        fs::write(&path, "2500000\n")?;

        let mut probe = PowerFile::open(path, 1e-6)?;
        assert_relative_eq!(probe.read_power()?.watts, 2.5);
        Ok(())
    }
}
