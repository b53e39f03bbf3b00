use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One element of an engine argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Flag(String),
    Option { name: String, value: OsString },
    Positional(OsString),
}

/// An executable and its ordered, typed arguments. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<Arg>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.args.push(Arg::Flag(name.into()));
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg::Option {
            name: name.into(),
            value: value.as_ref().to_os_string(),
        });
        self
    }

    pub fn option_if(self, name: impl Into<String>, value: Option<impl AsRef<OsStr>>) -> Self {
        match value {
            Some(value) => self.option(name, value),
            None => self,
        }
    }

    pub fn positional(mut self, value: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg::Positional(value.as_ref().to_os_string()));
        self
    }

    /// Flattened argument vector as handed to the OS.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() * 2);
        for arg in &self.args {
            match arg {
                Arg::Flag(name) => argv.push(OsString::from(name)),
                Arg::Option { name, value } => {
                    argv.push(OsString::from(name));
                    argv.push(value.clone());
                }
                Arg::Positional(value) => argv.push(value.clone()),
            }
        }
        argv
    }

    /// Value of a named option, if present.
    pub fn option_value(&self, name: &str) -> Option<&OsStr> {
        self.args.iter().find_map(|arg| match arg {
            Arg::Option { name: n, value } if n == name => Some(value.as_os_str()),
            _ => None,
        })
    }

    pub fn positionals(&self) -> Vec<&OsStr> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                Arg::Positional(value) => Some(value.as_os_str()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn to_command(&self, working_directory: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.argv()).current_dir(working_directory);
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.argv() {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}
