//! Host identity for unique file names.
//!
//! Maildir file names traditionally embed the host name so that two machines
//! sharing a mailbox over a network file system never produce the same name.
//! Where the system exposes a machine id and a boot id we use those instead,
//! but never verbatim: both are turned into application-specific identifiers
//! with HMAC-SHA256 (keyed by the raw system id, over a fixed application id),
//! so mailbox readers cannot correlate our files with other software that
//! uses the same system ids. This matches what systemd's
//! `sd_id128_get_machine_app_specific` computes.
//!
//! Detection happens once at startup via [`detect`]; the unique name
//! generator only ever sees the chosen [`HostIdentity`].

use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Fixed application id mixed into the system ids.
const APPLICATION_ID: [u8; 16] = [
    0x06, 0x0e, 0x97, 0x74, 0x4c, 0x65, 0x49, 0x95, 0xbf, 0xd6, 0x46, 0xcd, 0x3f, 0x16, 0x07, 0xc1,
];

/// Locations of the machine id, in order of preference.
const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Location of the per-boot id on Linux.
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Host name used when the system refuses to tell us its own.
const FALLBACK_HOSTNAME: &str = "localhost";

/// The host-specific parts of a unique file name.
///
/// Implementations must only return strings that never contain `/`, `:` or
/// the `.`-delimited field markers used by the name generator in a way that
/// could make two hosts produce the same name.
pub trait HostIdentity: fmt::Debug + Send + Sync {
    /// Identifies the current boot session, if the platform has one.
    ///
    /// Rendered as `X<session>` before the process id.
    fn session_tag(&self) -> Option<&str>;

    /// Identifies the host. Rendered as the last field of the name.
    fn host_tag(&self) -> &str;
}

/// Application-specific machine and boot ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIds {
    session: String,
    host: String,
}

impl SystemIds {
    /// Derives application-specific ids from the raw system ids.
    pub fn new(machine_id: Uuid, boot_id: Uuid) -> Self {
        let machine = app_specific_id(machine_id.as_bytes(), &APPLICATION_ID);
        let boot = app_specific_id(boot_id.as_bytes(), &APPLICATION_ID);
        SystemIds {
            session: boot.hyphenated().to_string(),
            host: format!("D{}", machine.hyphenated()),
        }
    }

    /// Reads the machine id and boot id from the usual Linux locations.
    ///
    /// Returns `None` if either is missing or unparseable.
    pub fn from_system() -> Option<Self> {
        let machine_id = MACHINE_ID_PATHS
            .iter()
            .find_map(|path| read_id_file(Path::new(path)))?;
        let boot_id = read_id_file(Path::new(BOOT_ID_PATH))?;
        Some(Self::new(machine_id, boot_id))
    }
}

impl HostIdentity for SystemIds {
    fn session_tag(&self) -> Option<&str> {
        Some(&self.session)
    }

    fn host_tag(&self) -> &str {
        &self.host
    }
}

/// The system host name, escaped for use in a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapedHostname {
    host: String,
}

impl EscapedHostname {
    /// Escapes `/` as `\057` and `:` as `\072`, the maildir convention.
    pub fn new(raw: &str) -> Self {
        EscapedHostname {
            host: raw.replace('/', "\\057").replace(':', "\\072"),
        }
    }

    /// Asks the operating system for its host name.
    pub fn from_system() -> Self {
        match system_hostname() {
            Some(name) => Self::new(&name),
            None => {
                warn!(
                    fallback = FALLBACK_HOSTNAME,
                    "Unable to determine host name, using fallback"
                );
                Self::new(FALLBACK_HOSTNAME)
            }
        }
    }
}

impl HostIdentity for EscapedHostname {
    fn session_tag(&self) -> Option<&str> {
        None
    }

    fn host_tag(&self) -> &str {
        &self.host
    }
}

/// Chooses the best host identity available on this system.
pub fn detect() -> Box<dyn HostIdentity> {
    match SystemIds::from_system() {
        Some(ids) => {
            debug!("Using application-specific machine and boot ids");
            Box::new(ids)
        }
        None => {
            debug!("Machine or boot id unavailable, using host name");
            Box::new(EscapedHostname::from_system())
        }
    }
}

/// Computes an application-specific id from a base system id.
///
/// The result is the first 16 bytes of HMAC-SHA256(key = base, msg = app),
/// with the UUID version set to 4 and the variant set to RFC 4122, so it reads
/// as a random UUID.
pub fn app_specific_id(base: &[u8; 16], app: &[u8; 16]) -> Uuid {
    let mut mac = HmacSha256::new_from_slice(base).expect("HMAC can take key of any size");
    mac.update(app);
    let digest = mac.finalize().into_bytes();

    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id[6] = (id[6] & 0x0f) | 0x40;
    id[8] = (id[8] & 0x3f) | 0x80;
    Uuid::from_bytes(id)
}

fn read_id_file(path: &Path) -> Option<Uuid> {
    let raw = fs::read_to_string(path).ok()?;
    Uuid::try_parse(raw.trim()).ok()
}

fn system_hostname() -> Option<String> {
    if let Ok(raw) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = raw.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    let output = Command::new("hostname")
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn app_specific_id_sets_version_and_variant() {
        let id = app_specific_id(&[0x11; 16], &APPLICATION_ID);
        assert_eq!(id.get_version_num(), 4);
        assert_eq!(id.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn app_specific_id_hides_base() {
        let base = Uuid::from_bytes([0x42; 16]);
        let derived = app_specific_id(base.as_bytes(), &APPLICATION_ID);
        assert_ne!(derived, base);
    }

    #[test]
    fn system_ids_render_boot_and_machine_differently() {
        let machine = Uuid::from_bytes([1; 16]);
        let boot = Uuid::from_bytes([2; 16]);
        let ids = SystemIds::new(machine, boot);

        let session = ids.session_tag().unwrap();
        assert!(ids.host_tag().starts_with('D'));
        assert_ne!(&ids.host_tag()[1..], session);
        assert!(!ids.host_tag().contains(machine.hyphenated().to_string().as_str()));
    }

    #[test]
    fn hostname_escaping() {
        let host = EscapedHostname::new("mail/host:1");
        assert_eq!(host.host_tag(), "mail\\057host\\0721");
        assert!(host.session_tag().is_none());
    }

    proptest! {
        #[test]
        fn app_specific_id_is_deterministic(base: [u8; 16]) {
            let a = app_specific_id(&base, &APPLICATION_ID);
            let b = app_specific_id(&base, &APPLICATION_ID);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn distinct_bases_give_distinct_ids(a: [u8; 16], b: [u8; 16]) {
            prop_assume!(a != b);
            prop_assert_ne!(
                app_specific_id(&a, &APPLICATION_ID),
                app_specific_id(&b, &APPLICATION_ID)
            );
        }

        #[test]
        fn escaped_hostname_never_contains_separators(raw in "[a-z0-9./:-]{1,40}") {
            let host = EscapedHostname::new(&raw);
            prop_assert!(!host.host_tag().contains('/'));
            prop_assert!(!host.host_tag().contains(':'));
        }
    }
}
