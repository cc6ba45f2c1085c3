//! ExecuteCmd support: template rendering and detached process creation.

use regex::Regex;
use std::io;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Unknown format key {{{0}}}")]
    UnknownKey(String),
}

/// Command template from an `executecmd` directive.
///
/// Recognized substitution slots: `{pid}`, `{procname}`, `{src_addr}`,
/// `{src_port}`, `{dst_addr}`, `{dst_port}`.
#[derive(Clone, Debug)]
pub struct CmdTemplate {
    template: String,
}

const SLOTS: &[&str] = &[
    "pid",
    "procname",
    "src_addr",
    "src_port",
    "dst_addr",
    "dst_port",
];

fn slot_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-zA-Z_]+)\}").unwrap())
}

impl CmdTemplate {
    /// Validate the template. Typos in slot names should ruin startup, not a
    /// debugging session, so every `{key}` token is checked here.
    pub fn new(template: &str) -> Result<Self, TemplateError> {
        for capture in slot_regex().captures_iter(template) {
            let key = &capture[1];
            if !SLOTS.contains(&key) {
                return Err(TemplateError::UnknownKey(key.to_owned()));
            }
        }
        Ok(CmdTemplate {
            template: template.to_owned(),
        })
    }

    /// Substitute the six named slots with the conversation's values
    pub fn render(
        &self,
        pid: u32,
        comm: &str,
        src_ip: IpAddr,
        sport: u16,
        dst_ip: IpAddr,
        dport: u16,
    ) -> String {
        self.template
            .replace("{pid}", &pid.to_string())
            .replace("{procname}", comm)
            .replace("{src_addr}", &src_ip.to_string())
            .replace("{src_port}", &sport.to_string())
            .replace("{dst_addr}", &dst_ip.to_string())
            .replace("{dst_port}", &dport.to_string())
    }
}

/// Spawn a command isolated from the diverter.
///
/// The child must survive diverter termination and, on Unix, ignore the
/// SIGINT a console Ctrl-C would deliver to the whole process group. The
/// caller gets the child PID back and never waits on it.
#[cfg(unix)]
pub fn execute_detached(cmd: &str) -> io::Result<u32> {
    use std::os::unix::process::CommandExt;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        command.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
            Ok(())
        });
    }
    let child = command.spawn()?;
    Ok(child.id())
}

#[cfg(windows)]
pub fn execute_detached(cmd: &str) -> io::Result<u32> {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    let child = Command::new("cmd")
        .arg("/C")
        .arg(cmd)
        .creation_flags(DETACHED_PROCESS)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id())
}
