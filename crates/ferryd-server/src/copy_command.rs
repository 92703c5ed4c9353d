// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Argument assembly for spawning `ferryd-url-copy` processes.

use std::path::{Path, PathBuf};

use ferryd_core::TransferFile;

/// Builds the long-option argv handed to a url-copy process.
///
/// Flags and options keep insertion order so the assembled command line
/// is stable across runs. Setting a key twice replaces the earlier value.
#[derive(Debug, Clone)]
pub struct CopyCommand {
    program: PathBuf,
    flags: Vec<&'static str>,
    options: Vec<(&'static str, String)>,
}

impl CopyCommand {
    /// Start an empty command for the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            flags: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Start a command carrying everything the transfer row itself
    /// determines: identity, endpoints, checksum, tokens and metadata.
    pub fn from_transfer(program: impl Into<PathBuf>, file: &TransferFile) -> Self {
        let mut cmd = Self::new(program);

        cmd.set_option("job-id", &file.job_id);
        cmd.set_option("file-id", file.file_id);
        cmd.set_option("source", &file.source_surl);
        cmd.set_option("destination", &file.dest_surl);
        cmd.set_option("vo", &file.vo_name);
        cmd.set_option("source-se", &file.source_se);
        cmd.set_option("dest-se", &file.dest_se);
        cmd.set_option("user-dn", escape_metadata(&file.user_dn));

        if let Some(checksum) = nonempty(&file.checksum) {
            cmd.set_option("checksum", checksum);
        }
        if let Some(method) = nonempty(&file.checksum_method) {
            cmd.set_option("compare-checksum", method);
        }
        cmd.set_flag("overwrite", file.overwrite);
        if let Some(token) = nonempty(&file.source_space_token) {
            cmd.set_option("source-token-desc", token);
        }
        if let Some(token) = nonempty(&file.dest_space_token) {
            cmd.set_option("dest-token-desc", token);
        }
        if file.pin_lifetime > 0 {
            cmd.set_option("pin-lifetime", file.pin_lifetime);
        }
        if let Some(token) = nonempty(&file.bringonline_token) {
            cmd.set_option("token-bring-online", token);
        }
        if let Some(metadata) = nonempty(&file.file_metadata) {
            cmd.set_option("file-metadata", escape_metadata(metadata));
        }
        if let Some(metadata) = nonempty(&file.job_metadata) {
            cmd.set_option("job-metadata", escape_metadata(metadata));
        }
        if file.user_filesize > 0 {
            cmd.set_option("user-filesize", file.user_filesize);
        }

        cmd
    }

    /// Set the transport parameters, omitting fields that are unset.
    pub fn set_protocol(&mut self, nostreams: i32, timeout: i32, buffer_size: i32) {
        if nostreams > 0 {
            self.set_option("nstreams", nostreams);
        }
        if timeout > 0 {
            self.set_option("timeout", timeout);
        }
        if buffer_size > 0 {
            self.set_option("tcp-buffersize", buffer_size);
        }
    }

    /// Mark the parameters as operator-fixed rather than tunable.
    pub fn set_manual_config(&mut self, on: bool) {
        self.set_flag("manual-config", on);
    }

    /// Mark the parameters as chosen by the feedback optimizer.
    pub fn set_auto_tuned(&mut self, on: bool) {
        self.set_flag("auto-tuned", on);
    }

    /// Skip the copy validation pass on the far side.
    pub fn set_strict_copy(&mut self, on: bool) {
        self.set_flag("strict-copy", on);
    }

    /// Force IPv4 resolution.
    pub fn set_ipv4(&mut self, on: bool) {
        self.set_flag("ipv4", on);
    }

    /// Force IPv6 resolution.
    pub fn set_ipv6(&mut self, on: bool) {
        self.set_flag("ipv6", on);
    }

    /// Enable status reporting into the message spool.
    pub fn set_monitoring(&mut self, on: bool) {
        self.set_flag("monitoring", on);
    }

    /// Debug verbosity, omitted at 0.
    pub fn set_debug_level(&mut self, level: u8) {
        if level > 0 {
            self.set_option("debug", level);
        }
    }

    /// Delegated proxy certificate to authenticate with.
    pub fn set_proxy(&mut self, path: &Path) {
        self.set_option("proxy", path.display());
    }

    /// BDII endpoint for endpoint resolution.
    pub fn set_infosystem(&mut self, endpoint: &str) {
        self.set_option("infosystem", endpoint);
    }

    /// Directory the process writes its transfer log into.
    pub fn set_log_dir(&mut self, path: &Path) {
        self.set_option("log-dir", path.display());
    }

    /// The executable to spawn.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The assembled argv, flags first, without the program itself.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() + self.options.len() * 2);
        for flag in &self.flags {
            args.push(format!("--{flag}"));
        }
        for (key, value) in &self.options {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        args
    }

    fn set_flag(&mut self, key: &'static str, on: bool) {
        let present = self.flags.iter().position(|f| *f == key);
        match (on, present) {
            (true, None) => self.flags.push(key),
            (false, Some(i)) => {
                self.flags.remove(i);
            }
            _ => {}
        }
    }

    fn set_option(&mut self, key: &'static str, value: impl ToString) {
        let value = value.to_string();
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.options.push((key, value)),
        }
    }
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Make metadata safe to pass through a single argv slot: spaces become
/// `?` and double quotes are backslash-escaped. The url-copy side
/// reverses the substitution before persisting.
fn escape_metadata(text: &str) -> String {
    text.replace(' ', "?").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferryd_core::persistence::MockPersistence;

    fn sample() -> TransferFile {
        let mut file = MockPersistence::sample_file(
            "job-cc",
            "atlas",
            "gsiftp://src.example.org",
            "gsiftp://dst.example.org",
        );
        file.file_id = 11;
        file
    }

    fn option_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
        let flag = format!("--{key}");
        args.iter()
            .position(|a| *a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_escape_metadata() {
        assert_eq!(escape_metadata("simple"), "simple");
        assert_eq!(escape_metadata("two words here"), "two?words?here");
        assert_eq!(escape_metadata(r#"{"k": "v"}"#), "{\\\"k\\\":?\\\"v\\\"}");
    }

    #[test]
    fn test_transfer_identity_args() {
        let cmd = CopyCommand::from_transfer("ferryd-url-copy", &sample());
        let args = cmd.args();

        assert_eq!(option_value(&args, "job-id"), Some("job-cc"));
        assert_eq!(option_value(&args, "file-id"), Some("11"));
        assert_eq!(
            option_value(&args, "source"),
            Some("gsiftp://src.example.org/path/file")
        );
        assert_eq!(
            option_value(&args, "destination"),
            Some("gsiftp://dst.example.org/path/file")
        );
        assert_eq!(option_value(&args, "vo"), Some("atlas"));
        assert_eq!(option_value(&args, "source-se"), Some("gsiftp://src.example.org"));
        assert_eq!(option_value(&args, "dest-se"), Some("gsiftp://dst.example.org"));
    }

    #[test]
    fn test_unset_row_fields_are_omitted() {
        let cmd = CopyCommand::from_transfer("ferryd-url-copy", &sample());
        let args = cmd.args();

        for key in [
            "--checksum",
            "--compare-checksum",
            "--overwrite",
            "--source-token-desc",
            "--dest-token-desc",
            "--pin-lifetime",
            "--token-bring-online",
            "--file-metadata",
            "--job-metadata",
            "--user-filesize",
        ] {
            assert!(!args.contains(&key.to_string()), "unexpected {key}");
        }
    }

    #[test]
    fn test_populated_row_fields_are_passed() {
        let mut file = sample();
        file.checksum = Some("ADLER32:deadbeef".to_string());
        file.checksum_method = Some("ADLER32".to_string());
        file.overwrite = true;
        file.source_space_token = Some("SRC_TOKEN".to_string());
        file.dest_space_token = Some("DST_TOKEN".to_string());
        file.pin_lifetime = 600;
        file.bringonline_token = Some("req-123".to_string());
        file.file_metadata = Some("run 2025".to_string());
        file.user_filesize = 1048576;

        let args = CopyCommand::from_transfer("ferryd-url-copy", &file).args();

        assert_eq!(option_value(&args, "checksum"), Some("ADLER32:deadbeef"));
        assert_eq!(option_value(&args, "compare-checksum"), Some("ADLER32"));
        assert!(args.contains(&"--overwrite".to_string()));
        assert_eq!(option_value(&args, "source-token-desc"), Some("SRC_TOKEN"));
        assert_eq!(option_value(&args, "dest-token-desc"), Some("DST_TOKEN"));
        assert_eq!(option_value(&args, "pin-lifetime"), Some("600"));
        assert_eq!(option_value(&args, "token-bring-online"), Some("req-123"));
        assert_eq!(option_value(&args, "file-metadata"), Some("run?2025"));
        assert_eq!(option_value(&args, "user-filesize"), Some("1048576"));
    }

    #[test]
    fn test_protocol_fields_omit_unset_values() {
        let mut cmd = CopyCommand::new("ferryd-url-copy");
        cmd.set_protocol(4, 3600, 0);

        let args = cmd.args();
        assert_eq!(option_value(&args, "nstreams"), Some("4"));
        assert_eq!(option_value(&args, "timeout"), Some("3600"));
        assert!(!args.contains(&"--tcp-buffersize".to_string()));
    }

    #[test]
    fn test_flags_precede_options() {
        let mut cmd = CopyCommand::new("ferryd-url-copy");
        cmd.set_option("job-id", "j");
        cmd.set_monitoring(true);
        cmd.set_auto_tuned(true);

        let args = cmd.args();
        assert_eq!(args[0], "--monitoring");
        assert_eq!(args[1], "--auto-tuned");
        assert_eq!(args[2], "--job-id");
    }

    #[test]
    fn test_setting_twice_replaces() {
        let mut cmd = CopyCommand::new("ferryd-url-copy");
        cmd.set_protocol(4, 3600, 0);
        cmd.set_protocol(8, 3600, 0);

        let args = cmd.args();
        assert_eq!(option_value(&args, "nstreams"), Some("8"));
        assert_eq!(args.iter().filter(|a| *a == "--nstreams").count(), 1);
    }

    #[test]
    fn test_flag_can_be_cleared() {
        let mut cmd = CopyCommand::new("ferryd-url-copy");
        cmd.set_manual_config(true);
        cmd.set_manual_config(false);

        assert!(cmd.args().is_empty());
    }

    #[test]
    fn test_debug_level_zero_is_omitted() {
        let mut cmd = CopyCommand::new("ferryd-url-copy");
        cmd.set_debug_level(0);
        assert!(cmd.args().is_empty());

        cmd.set_debug_level(2);
        assert_eq!(option_value(&cmd.args(), "debug"), Some("2"));
    }

    #[test]
    fn test_runtime_surface() {
        let mut cmd = CopyCommand::new("/usr/bin/ferryd-url-copy");
        cmd.set_proxy(Path::new("/tmp/x509up_h42"));
        cmd.set_infosystem("bdii.example.org:2170");
        cmd.set_log_dir(Path::new("/var/log/ferryd"));

        assert_eq!(cmd.program(), Path::new("/usr/bin/ferryd-url-copy"));
        let args = cmd.args();
        assert_eq!(option_value(&args, "proxy"), Some("/tmp/x509up_h42"));
        assert_eq!(option_value(&args, "infosystem"), Some("bdii.example.org:2170"));
        assert_eq!(option_value(&args, "log-dir"), Some("/var/log/ferryd"));
    }
}
