//! Session commands
//!
//! Authentication, navigation, file and format-string commands. Job
//! control lives in `jobs`, data transfers in `transfers`.

use chrono::NaiveDateTime;
use log::debug;

use crate::error::{FaxError, FaxResult};
use crate::protocol::parser::{parse_first_number, parse_mdtm, parse_quoted_path};
use crate::protocol::responses::{
    DATA_OPENING, FILE_ACTION_OK, LOGIN_SUCCESS, NOT_IMPLEMENTED_SUPERFLUOUS, OK, PARAMETER,
    PASSWORD_REQUIRED, PATH_CREATED, PENDING_FURTHER_INFO,
};
use crate::protocol::{Command, Response, Timezone, TransferMode, TransferType};
use crate::session::ProtocolSession;

impl ProtocolSession {
    // --------------------
    // Authentication
    // --------------------

    /// Send `user`. Returns true when the server wants a password.
    pub async fn user(&mut self, name: &str) -> FaxResult<bool> {
        let resp = self
            .codec
            .expect(Command::User, &[name], &[LOGIN_SUCCESS, PASSWORD_REQUIRED])
            .await?;
        Ok(resp.code == PASSWORD_REQUIRED)
    }

    pub async fn pass(&mut self, password: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Pass, &[password], &[LOGIN_SUCCESS, NOT_IMPLEMENTED_SUPERFLUOUS])
            .await?;
        Ok(())
    }

    /// Raise the session to administrative privileges.
    pub async fn admin(&mut self, password: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Admin, &[password], &[LOGIN_SUCCESS])
            .await?;
        Ok(())
    }

    /// Log in as `user`, sending `password` only when the server asks for
    /// one. Returns whether a password was needed.
    pub async fn authenticate(&mut self, user: &str, password: Option<&str>) -> FaxResult<bool> {
        let needs_password = self.user(user).await?;
        if needs_password {
            let password = password.ok_or_else(|| {
                FaxError::InvalidArgument(format!("server requires a password for {}", user))
            })?;
            self.pass(password).await?;
        }
        debug!("Authenticated as {} on {}:{}", user, self.host, self.port);
        Ok(needs_password)
    }

    // --------------------
    // Session settings
    // --------------------

    pub async fn noop(&mut self) -> FaxResult<()> {
        self.codec.expect(Command::Noop, &[], &[OK]).await?;
        Ok(())
    }

    pub async fn type_(&mut self, transfer_type: TransferType) -> FaxResult<()> {
        let code = transfer_type.code().to_string();
        self.codec.expect(Command::Type, &[&code], &[OK]).await?;
        self.transfer_type = transfer_type;
        Ok(())
    }

    /// Select the transfer mode. Block and Compressed are refused before
    /// anything is sent.
    pub async fn mode(&mut self, transfer_mode: TransferMode) -> FaxResult<()> {
        if !transfer_mode.is_supported() {
            return Err(FaxError::UnsupportedMode(transfer_mode.code()));
        }
        let code = transfer_mode.code().to_string();
        self.codec.expect(Command::Mode, &[&code], &[OK]).await?;
        self.transfer_mode = transfer_mode;
        Ok(())
    }

    /// Current idle timeout of the server, in seconds.
    pub async fn idle(&mut self) -> FaxResult<u64> {
        let resp = self.codec.expect(Command::Idle, &[], &[PARAMETER]).await?;
        parse_first_number(&resp.text())
    }

    pub async fn set_idle(&mut self, seconds: u64) -> FaxResult<()> {
        let seconds = seconds.to_string();
        self.codec
            .expect(Command::Idle, &[&seconds], &[PARAMETER])
            .await?;
        Ok(())
    }

    pub async fn tzone(&mut self, timezone: Timezone) -> FaxResult<()> {
        self.codec
            .expect(Command::Tzone, &[timezone.wire_name()], &[OK])
            .await?;
        Ok(())
    }

    /// Send a `site` command with whatever arguments it takes.
    pub async fn site(&mut self, args: &[&str]) -> FaxResult<Response> {
        self.codec.expect(Command::Site, args, &[OK]).await
    }

    /// Ask the server to push status events matching `spec` to the
    /// address announced with the preceding `port`. The server answers
    /// `150` and then connects.
    pub async fn site_trigger(&mut self, spec: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Site, &["trigger", spec], &[DATA_OPENING])
            .await?;
        Ok(())
    }

    // --------------------
    // Navigation
    // --------------------

    pub async fn pwd(&mut self) -> FaxResult<String> {
        let resp = self.codec.expect(Command::Pwd, &[], &[PATH_CREATED]).await?;
        parse_quoted_path(&resp.text())
    }

    pub async fn cwd(&mut self, dir: &str) -> FaxResult<()> {
        self.codec.expect(Command::Cwd, &[dir], &[FILE_ACTION_OK]).await?;
        Ok(())
    }

    pub async fn cdup(&mut self) -> FaxResult<()> {
        self.codec
            .expect(Command::Cdup, &[], &[OK, FILE_ACTION_OK])
            .await?;
        Ok(())
    }

    // --------------------
    // Files
    // --------------------

    pub async fn size(&mut self, path: &str) -> FaxResult<u64> {
        let resp = self.codec.expect(Command::Size, &[path], &[PARAMETER]).await?;
        parse_first_number(&resp.text())
    }

    /// Modification time as reported by the server.
    pub async fn mdtm(&mut self, path: &str) -> FaxResult<NaiveDateTime> {
        let resp = self.codec.expect(Command::Mdtm, &[path], &[PARAMETER]).await?;
        parse_mdtm(&resp.text())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Rnfr, &[from], &[PENDING_FURTHER_INFO])
            .await?;
        self.codec
            .expect(Command::Rnto, &[to], &[FILE_ACTION_OK])
            .await?;
        Ok(())
    }

    pub async fn delete(&mut self, path: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Dele, &[path], &[FILE_ACTION_OK])
            .await?;
        Ok(())
    }

    // --------------------
    // Status format strings
    // --------------------

    pub async fn jobfmt(&mut self) -> FaxResult<String> {
        self.format_string(Command::Jobfmt).await
    }

    pub async fn set_jobfmt(&mut self, format: &str) -> FaxResult<()> {
        self.set_format_string(Command::Jobfmt, format).await
    }

    pub async fn mdmfmt(&mut self) -> FaxResult<String> {
        self.format_string(Command::Mdmfmt).await
    }

    pub async fn set_mdmfmt(&mut self, format: &str) -> FaxResult<()> {
        self.set_format_string(Command::Mdmfmt, format).await
    }

    pub async fn rcvfmt(&mut self) -> FaxResult<String> {
        self.format_string(Command::Rcvfmt).await
    }

    pub async fn set_rcvfmt(&mut self, format: &str) -> FaxResult<()> {
        self.set_format_string(Command::Rcvfmt, format).await
    }

    pub async fn filefmt(&mut self) -> FaxResult<String> {
        self.format_string(Command::Filefmt).await
    }

    pub async fn set_filefmt(&mut self, format: &str) -> FaxResult<()> {
        self.set_format_string(Command::Filefmt, format).await
    }

    /// Replies look like `200 JOBFMT is "%-4j %3i"`; an unquoted reply is
    /// returned as is.
    async fn format_string(&mut self, command: Command) -> FaxResult<String> {
        let resp = self.codec.expect(command, &[], &[OK, PARAMETER]).await?;
        let message = resp.message();
        if message.contains('"') {
            parse_quoted_path(message)
        } else {
            Ok(message.to_string())
        }
    }

    async fn set_format_string(&mut self, command: Command, format: &str) -> FaxResult<()> {
        let quoted = format!("\"{}\"", format.replace('"', "\"\""));
        self.codec.expect(command, &[&quoted], &[OK]).await?;
        Ok(())
    }
}
