//! Line-oriented command shell over a [`FileSystem`].

use crate::fs::{Entry, FileSystem};
use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Unknown command: {0}. Use 'help' for help")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Touch(String),
    Edit(String, String),
    Cat(String),
    Rm(String),
    Ls,
    Cd(String),
    Mkdir(String),
    Rmdir(String),
    Mv(String, String),
    MvDir(String, String),
    Pwd,
    Df,
    Format,
    Help,
    Exit,
}

const HELP: &str = "\
Available commands:
touch <filename> - Create a new file
edit <filename> <data> - Write data to a file
cat <filename> - Read a file
rm <filename> - Delete a file
ls - List files and directories in the current directory
cd <directory_name> - Change to a directory
mkdir <directory_name> - Create a new directory
rmdir <directory_name> - Remove a directory
mv <old> <new> - Rename a file
mvdir <old> <new> - Rename a directory
pwd - Print the current working directory
df - Show total and used space
format - Remove every file and directory
exit - Exit the file system";

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();
        let args: Vec<&str> = rest.split_whitespace().collect();
        let one = |usage: &'static str| match args.as_slice() {
            [arg] => Ok(arg.to_string()),
            _ => Err(ParseError::Usage(usage)),
        };
        let two = |usage: &'static str| match args.as_slice() {
            [old, new] => Ok((old.to_string(), new.to_string())),
            _ => Err(ParseError::Usage(usage)),
        };
        let command = match name {
            "touch" => Command::Touch(one("touch <filename>")?),
            "edit" => {
                let usage = ParseError::Usage("edit <filename> <data>");
                let (file, data) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| usage.clone())?;
                let data = data.trim_start();
                if data.is_empty() {
                    return Err(usage);
                }
                Command::Edit(file.to_owned(), data.to_owned())
            }
            "cat" => Command::Cat(one("cat <filename>")?),
            "rm" => Command::Rm(one("rm <filename>")?),
            "ls" => Command::Ls,
            "cd" => Command::Cd(one("cd <directory_name>")?),
            "mkdir" => Command::Mkdir(one("mkdir <directory_name>")?),
            "rmdir" => Command::Rmdir(one("rmdir <directory_name>")?),
            "mv" => {
                let (old, new) = two("mv <old> <new>")?;
                Command::Mv(old, new)
            }
            "mvdir" => {
                let (old, new) = two("mvdir <old> <new>")?;
                Command::MvDir(old, new)
            }
            "pwd" => Command::Pwd,
            "df" => Command::Df,
            "format" => Command::Format,
            "help" => Command::Help,
            "exit" => Command::Exit,
            other => return Err(ParseError::Unknown(other.to_owned())),
        };
        Ok(command)
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Runs a single command. Returns `false` once the shell should stop.
pub fn execute(fs: &mut FileSystem, command: Command, out: &mut impl Write) -> io::Result<bool> {
    trace!("Executing {command:?}");
    let result = match command {
        Command::Touch(name) => fs.create_file(&name).map(|_| "File created".to_owned()),
        Command::Edit(name, data) => fs
            .write_file(&name, data.as_bytes())
            .map(|_| "File written".to_owned()),
        Command::Cat(name) => {
            fs.read_file(&name).map(|data| String::from_utf8_lossy(&data).into_owned())
        }
        Command::Rm(name) => fs.delete_file(&name).map(|_| "File deleted".to_owned()),
        Command::Ls => {
            let entries = fs.list_directory();
            writeln!(out, "Dir:{},Total {}", fs.current_name(), entries.len())?;
            for entry in entries {
                match entry {
                    Entry::Directory { name, items } => writeln!(out, "{name}/\t\t{items} items")?,
                    Entry::File {
                        name,
                        size,
                        modified,
                    } => writeln!(out, "{name}\t\t{size} bytes\t\t{}", unix_seconds(modified))?,
                }
            }
            return Ok(true);
        }
        Command::Cd(name) => fs.change_directory(&name).map(|_| fs.current_path()),
        Command::Mkdir(name) => fs.make_directory(&name).map(|_| "Directory created".to_owned()),
        Command::Rmdir(name) => fs.remove_directory(&name).map(|_| "Directory removed".to_owned()),
        Command::Mv(old, new) => fs.rename_file(&old, &new).map(|_| "File renamed".to_owned()),
        Command::MvDir(old, new) => fs
            .rename_directory(&old, &new)
            .map(|_| "Directory renamed".to_owned()),
        Command::Pwd => Ok(fs.current_path()),
        Command::Df => {
            let (total, used) = fs.space_usage();
            Ok(format!("Total {total} bytes, used {used} bytes"))
        }
        Command::Format => {
            fs.format();
            Ok("Formatted".to_owned())
        }
        Command::Help => Ok(HELP.to_owned()),
        Command::Exit => return Ok(false),
    };
    match result {
        Ok(message) => writeln!(out, "{message}")?,
        Err(err) => writeln!(out, "{err}")?,
    }
    Ok(true)
}

/// Reads commands from `input` until `exit` or end of input.
pub fn run(fs: &mut FileSystem, input: impl BufRead, mut out: impl Write) -> io::Result<()> {
    write!(out, "{}>", fs.current_name())?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            match line.parse::<Command>() {
                Ok(command) => {
                    if !execute(fs, command, &mut out)? {
                        return Ok(());
                    }
                }
                Err(err) => writeln!(out, "{err}")?,
            }
        }
        write!(out, "{}>", fs.current_name())?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
fn run_script(fs: &mut FileSystem, script: &str) -> String {
    let mut out = Vec::new();
    run(fs, script.as_bytes(), &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_parse_commands() {
    assert_eq!("touch a.txt".parse::<Command>(), Ok(Command::Touch("a.txt".into())));
    assert_eq!(
        "edit a.txt hello  world".parse::<Command>(),
        Ok(Command::Edit("a.txt".into(), "hello  world".into()))
    );
    assert_eq!(
        "mvdir old new".parse::<Command>(),
        Ok(Command::MvDir("old".into(), "new".into()))
    );
    assert_eq!("  ls ".parse::<Command>(), Ok(Command::Ls));
    assert_eq!(
        "touch".parse::<Command>(),
        Err(ParseError::Usage("touch <filename>"))
    );
    assert_eq!(
        "edit a.txt".parse::<Command>(),
        Err(ParseError::Usage("edit <filename> <data>"))
    );
    assert_eq!(
        "mv a".parse::<Command>(),
        Err(ParseError::Usage("mv <old> <new>"))
    );
    assert_eq!(
        "frobnicate".parse::<Command>(),
        Err(ParseError::Unknown("frobnicate".into()))
    );
}

#[test]
fn test_script_session() {
    use crate::fs::Config;
    let mut fs = FileSystem::new(Config {
        block_size: 512,
        block_count: 8,
        ..Config::default()
    })
    .unwrap();
    let script = "mkdir docs\ncd docs\ntouch a.txt\nedit a.txt hi there\ncat a.txt\npwd\n\n\
                  cd ..\nls\ndf\nexit\npwd\n";
    let output = run_script(&mut fs, script);
    assert!(output.contains("hi there\n"));
    assert!(output.contains("docs>"));
    assert!(output.contains("/docs\n"));
    assert!(output.contains("docs/\t\t1 items"));
    assert!(output.contains("Total 4096 bytes, used 8 bytes"));
    // nothing runs after exit
    assert_eq!(output.matches("/docs\n").count(), 2);
    assert_eq!(fs.current_path(), "/");
}

#[test]
fn test_errors_are_reported() {
    use crate::fs::Config;
    let mut fs = FileSystem::new(Config {
        block_size: 512,
        block_count: 1,
        ..Config::default()
    })
    .unwrap();
    let output = run_script(&mut fs, "cat nope\ntouch a\ntouch a\nrm\nbogus\n");
    assert!(output.contains("File 'nope' not found"));
    assert!(output.contains("File 'a' already exists"));
    assert!(output.contains("Usage: rm <filename>"));
    assert!(output.contains("Unknown command: bogus"));
}
