//! Filesystem marker files attached to one server.
//!
//! Cookies express cross-process intents that survive restarts of the
//! manager: set by the action that requested or completed a transition,
//! deleted by the component that observes the transition finished. They are
//! deliberately coarse; set and clear are idempotent and no atomic
//! read-modify-write is assumed across processes.

use std::io;
use std::path::Path;

/// Known marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cookie {
    Provision,
    Reprovision,
    Restart,
    WaitStart,
    WaitStop,
}

impl Cookie {
    pub fn filename(&self) -> &'static str {
        match self {
            Cookie::Provision => "cookie_provision",
            Cookie::Reprovision => "cookie_waitreprovision",
            Cookie::Restart => "cookie_restart",
            Cookie::WaitStart => "cookie_waitstart",
            Cookie::WaitStop => "cookie_waitstop",
        }
    }

    pub const ALL: [Cookie; 5] = [
        Cookie::Provision,
        Cookie::Reprovision,
        Cookie::Restart,
        Cookie::WaitStart,
        Cookie::WaitStop,
    ];
}

/// Create the zero-length marker. Idempotent.
pub fn set(datadir: &Path, cookie: Cookie) -> io::Result<()> {
    std::fs::File::create(datadir.join(cookie.filename()))?;
    Ok(())
}

/// Remove the marker. Idempotent: a missing cookie is not an error.
pub fn clear(datadir: &Path, cookie: Cookie) -> io::Result<()> {
    match std::fs::remove_file(datadir.join(cookie.filename())) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn has(datadir: &Path, cookie: Cookie) -> bool {
    datadir.join(cookie.filename()).exists()
}

/// Remove every known cookie.
pub fn clear_all(datadir: &Path) {
    for cookie in Cookie::ALL {
        let _ = clear(datadir, cookie);
    }
}
