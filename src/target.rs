//! iSCSI target server implementation
//!
//! This module provides the main server structure, its connection-handling
//! accept loop, and the builder used to configure it.

use crate::acl::AccessPolicy;
use crate::auth::AuthConfig;
use crate::error::{IscsiError, ScsiResult};
use crate::lu::{CancelToken, LogicalUnit};
use crate::pdu::{self, opcode, IscsiPdu};
use crate::scsi::{scsi_status, ScsiBlockDevice, ScsiHandler};
use crate::session::{DigestType, IscsiSession, PendingWrite};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval for the accept loop while waiting for a shutdown signal.
///
/// There is no portable std primitive to wait on a socket and a wakeup flag
/// at once without pulling in a reactor crate, so the acceptor uses a
/// nonblocking listener and polls this flag instead of a real control pipe.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A target's logical units, keyed by LUN (SPEC_FULL §3 Target(LU)).
pub type LuRegistry<D> = HashMap<u64, Arc<LogicalUnit<D>>>;

/// iSCSI target server
pub struct IscsiTarget<D: ScsiBlockDevice> {
    bind_addr: String,
    target_name: String,
    portal_group_tag: String,
    luns: Arc<LuRegistry<D>>,
    auth_config: AuthConfig,
    allowed_initiators: Option<Vec<String>>,
    access_policy: Option<Arc<AccessPolicy>>,
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
    running: Arc<AtomicBool>,
    accepting_new_sessions: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    active_sessions: Arc<AtomicUsize>,
}

/// Decrements a connection-count gauge when the connection thread exits.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<D: ScsiBlockDevice + Send + Sync + 'static> IscsiTarget<D> {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder<D> {
        IscsiTargetBuilder::new()
    }

    /// Run the iSCSI target server
    ///
    /// Binds the listening socket and accepts connections until [`stop`] is
    /// called. Each connection is served on its own thread. Blocks the
    /// calling thread.
    ///
    /// [`stop`]: IscsiTarget::stop
    pub fn run(&self) -> ScsiResult<()> {
        log::info!("iSCSI target starting on {}", self.bind_addr);
        log::info!("Target name: {}", self.target_name);

        let listener = TcpListener::bind(&self.bind_addr).map_err(IscsiError::Io)?;
        listener.set_nonblocking(true).map_err(IscsiError::Io)?;

        self.running.store(true, Ordering::Release);
        self.accepting_new_sessions.store(true, Ordering::Release);

        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("Accepted connection from {}", addr);
                    let luns = Arc::clone(&self.luns);
                    let target_name = self.target_name.clone();
                    let portal_group_tag = self.portal_group_tag.clone();
                    let bind_addr = self.bind_addr.clone();
                    let auth_config = self.auth_config.clone();
                    let allowed_initiators = self.allowed_initiators.clone();
                    let access_policy = self.access_policy.clone();
                    let accepting = Arc::clone(&self.accepting_new_sessions);
                    let max_connections = self.max_connections;
                    let max_sessions = self.max_sessions;
                    let active_connections = Arc::clone(&self.active_connections);
                    let active_sessions = Arc::clone(&self.active_sessions);
                    std::thread::spawn(move || {
                        handle_connection(
                            stream,
                            addr.ip(),
                            target_name,
                            portal_group_tag,
                            bind_addr,
                            luns,
                            auth_config,
                            allowed_initiators,
                            access_policy,
                            accepting,
                            max_connections,
                            max_sessions,
                            active_connections,
                            active_sessions,
                        );
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    log::warn!("accept() failed: {}", e);
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        log::info!("iSCSI target stopped accepting connections");
        Ok(())
    }

    /// Stop accepting new logins while letting existing sessions finish.
    ///
    /// New Login Requests on already-accepted connections are rejected with
    /// a "service unavailable" Login Response; connections already in full
    /// feature phase are left alone.
    pub fn shutdown_gracefully(&self) {
        log::info!("iSCSI target beginning graceful shutdown");
        self.accepting_new_sessions.store(false, Ordering::Release);
    }

    /// Number of TCP connections currently being served.
    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Number of sessions currently in full-feature phase.
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Stop the accept loop, returning control to [`run`]'s caller.
    ///
    /// Does not forcibly close connections already in flight; they end on
    /// their own via logout or peer disconnect.
    ///
    /// [`run`]: IscsiTarget::run
    pub fn stop(&self) {
        self.accepting_new_sessions.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

/// Builder for configuring an iSCSI target
pub struct IscsiTargetBuilder<D: ScsiBlockDevice> {
    bind_addr: Option<String>,
    target_name: Option<String>,
    portal_group_tag: String,
    luns: Vec<(u64, D)>,
    auth_config: AuthConfig,
    allowed_initiators: Option<Vec<String>>,
    access_policy: Option<Arc<AccessPolicy>>,
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
}

impl<D: ScsiBlockDevice + Send + Sync + 'static> IscsiTargetBuilder<D> {
    fn new() -> Self {
        Self {
            bind_addr: None,
            target_name: None,
            portal_group_tag: "1".to_string(),
            luns: Vec::new(),
            auth_config: AuthConfig::None,
            allowed_initiators: None,
            access_policy: None,
            max_connections: None,
            max_sessions: None,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    /// Set the portal group tag this target's single portal belongs to
    /// (default "1"), used by `access_policy`'s PG x IG mapping check.
    pub fn portal_group_tag(mut self, tag: &str) -> Self {
        self.portal_group_tag = tag.to_string();
        self
    }

    /// Configure authentication (CHAP / Mutual CHAP) for this target
    pub fn with_auth(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    /// Restrict logins to the given initiator IQNs (default: allow all)
    pub fn with_allowed_initiators(mut self, initiators: Vec<String>) -> Self {
        self.allowed_initiators = Some(initiators);
        self
    }

    /// Restrict logins to the given initiator IQNs (default: allow all)
    pub fn allowed_initiators(self, initiators: Vec<String>) -> Self {
        self.with_allowed_initiators(initiators)
    }

    /// Install a portal-group x initiator-group access policy (SPEC_FULL
    /// §4.3), enforced at login alongside `allowed_initiators`.
    pub fn access_policy(mut self, policy: AccessPolicy) -> Self {
        self.access_policy = Some(Arc::new(policy));
        self
    }

    /// Cap the number of simultaneously open TCP connections. Connections
    /// beyond the limit are rejected at login with TOO_MANY_CONNECTIONS
    /// (RFC 3720 status 0x02/0x06).
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Cap the number of sessions (post-login, full-feature-phase
    /// connections) this target will admit at once. Logins beyond the limit
    /// are rejected with OUT_OF_RESOURCES (RFC 3720 status 0x03/0x02).
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Add an additional logical unit at the given LUN. Combine with
    /// [`build_multi`](IscsiTargetBuilder::build_multi) for multi-LU
    /// targets; single-LU callers can use
    /// [`build`](IscsiTargetBuilder::build) instead.
    pub fn lun(mut self, lun: u64, device: D) -> Self {
        self.luns.push((lun, device));
        self
    }

    /// Build the target with a single storage device at LUN 0.
    pub fn build(mut self, device: D) -> ScsiResult<IscsiTarget<D>> {
        self.luns.push((0, device));
        self.finish()
    }

    /// Build a multi-LU target from the devices registered via
    /// [`lun`](IscsiTargetBuilder::lun).
    pub fn build_multi(self) -> ScsiResult<IscsiTarget<D>> {
        self.finish()
    }

    fn finish(self) -> ScsiResult<IscsiTarget<D>> {
        let bind_addr = self.bind_addr.unwrap_or_else(|| "0.0.0.0:3260".to_string());
        let target_name = self.target_name.unwrap_or_else(|| {
            "iqn.2025-12.local:storage.default".to_string()
        });

        if !target_name.starts_with("iqn.") {
            return Err(IscsiError::Config(
                "target_name must be in IQN format (e.g., iqn.2025-12.local:storage.disk1)".to_string()
            ));
        }
        if self.luns.is_empty() {
            return Err(IscsiError::Config("target must have at least one logical unit".to_string()));
        }

        let mut luns = HashMap::new();
        for (lun, device) in self.luns {
            if luns.insert(lun, Arc::new(LogicalUnit::new(lun, device))).is_some() {
                return Err(IscsiError::Config(format!("duplicate LUN {lun} configured")));
            }
        }

        Ok(IscsiTarget {
            bind_addr,
            target_name,
            portal_group_tag: self.portal_group_tag,
            luns: Arc::new(luns),
            auth_config: self.auth_config,
            allowed_initiators: self.allowed_initiators,
            access_policy: self.access_policy,
            max_connections: self.max_connections,
            max_sessions: self.max_sessions,
            running: Arc::new(AtomicBool::new(false)),
            accepting_new_sessions: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Read one PDU off the wire, honoring `max_recv_data_segment_length`,
/// passing through AHS bytes, and verifying the negotiated digest trailers.
///
/// On a digest mismatch returns `IscsiError::DigestMismatch` carrying the
/// `pdu::reject_reason` code and the BHS bytes of the rejected PDU, per RFC
/// 3720 §10.17 / the ERL-0 "reject then close" rule.
fn read_pdu(
    stream: &mut TcpStream,
    max_data_segment_len: u32,
    header_digest: bool,
    data_digest: bool,
) -> ScsiResult<IscsiPdu> {
    let mut bhs = [0u8; pdu::BHS_SIZE];
    stream.read_exact(&mut bhs).map_err(IscsiError::Io)?;

    let ahs_bytes = bhs[4] as usize * 4;
    let data_len = ((bhs[5] as u32) << 16) | ((bhs[6] as u32) << 8) | (bhs[7] as u32);
    let padded_data_len = ((data_len + 3) / 4) * 4;

    let mut header_buf = Vec::with_capacity(pdu::BHS_SIZE + ahs_bytes);
    header_buf.extend_from_slice(&bhs);

    if ahs_bytes > 0 {
        let mut ahs = vec![0u8; ahs_bytes];
        stream.read_exact(&mut ahs).map_err(IscsiError::Io)?;
        header_buf.extend_from_slice(&ahs);
    }

    if header_digest {
        let mut trailer = [0u8; pdu::DIGEST_SIZE];
        stream.read_exact(&mut trailer).map_err(IscsiError::Io)?;
        let expected = pdu::crc32c(&header_buf);
        if BigEndian::read_u32(&trailer) != expected {
            return Err(IscsiError::DigestMismatch {
                reason: pdu::reject_reason::HEADER_DIGEST_ERROR,
                header_bytes: header_buf[..pdu::BHS_SIZE].to_vec(),
            });
        }
    }

    let mut buf = header_buf;
    let data_start = buf.len();
    if padded_data_len > 0 {
        let mut data = vec![0u8; padded_data_len as usize];
        stream.read_exact(&mut data).map_err(IscsiError::Io)?;
        buf.extend_from_slice(&data);
    }

    if data_digest && data_len > 0 {
        let mut trailer = [0u8; pdu::DIGEST_SIZE];
        stream.read_exact(&mut trailer).map_err(IscsiError::Io)?;
        let expected = pdu::crc32c(&buf[data_start..data_start + data_len as usize]);
        if BigEndian::read_u32(&trailer) != expected {
            return Err(IscsiError::DigestMismatch {
                reason: pdu::reject_reason::DATA_DIGEST_ERROR,
                header_bytes: buf[..pdu::BHS_SIZE].to_vec(),
            });
        }
    }

    IscsiPdu::from_bytes_checked(&buf, max_data_segment_len)
}

fn write_pdu(stream: &mut TcpStream, pdu: &IscsiPdu, header_digest: bool, data_digest: bool) -> ScsiResult<()> {
    stream
        .write_all(&pdu.to_bytes_digested(header_digest, data_digest))
        .map_err(IscsiError::Io)
}

/// Serve one accepted TCP connection for its entire lifetime: login,
/// full-feature command processing, and logout.
#[allow(clippy::too_many_arguments)]
fn handle_connection<D: ScsiBlockDevice + Send + Sync + 'static>(
    mut stream: TcpStream,
    source_ip: std::net::IpAddr,
    target_name: String,
    portal_group_tag: String,
    bind_addr: String,
    luns: Arc<LuRegistry<D>>,
    auth_config: AuthConfig,
    allowed_initiators: Option<Vec<String>>,
    access_policy: Option<Arc<AccessPolicy>>,
    accepting_new_sessions: Arc<AtomicBool>,
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
    active_connections: Arc<AtomicUsize>,
    active_sessions: Arc<AtomicUsize>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let _ = stream.set_nodelay(true);

    active_connections.fetch_add(1, Ordering::AcqRel);
    let _connection_guard = ConnectionGuard(Arc::clone(&active_connections));
    let mut session_counted = false;

    let mut session = IscsiSession::new();
    session.set_auth_config(auth_config);
    session.set_allowed_initiators(allowed_initiators);
    session.set_access_policy(access_policy);
    session.set_connection_context(Some(source_ip), portal_group_tag);

    loop {
        let header_digest = session.params.header_digest == DigestType::CRC32C;
        let data_digest = session.params.data_digest == DigestType::CRC32C;

        let request = match read_pdu(
            &mut stream,
            session.params.max_recv_data_segment_length,
            header_digest,
            data_digest,
        ) {
            Ok(pdu) => pdu,
            Err(IscsiError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof
                    || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                log::info!("connection {} closed by peer", peer);
                break;
            }
            Err(IscsiError::DigestMismatch { reason, header_bytes }) => {
                log::warn!("connection {}: digest mismatch (reason 0x{:02x}), rejecting and closing", peer, reason);
                let reject = IscsiPdu::reject(
                    reason,
                    session.stat_sn,
                    session.exp_cmd_sn,
                    session.max_cmd_sn,
                    &header_bytes,
                );
                let _ = write_pdu(&mut stream, &reject, header_digest, false);
                break;
            }
            Err(e) => {
                log::warn!("connection {}: read error: {}", peer, e);
                break;
            }
        };

        let result = dispatch(
            &mut session,
            &request,
            &target_name,
            &bind_addr,
            &luns,
            &accepting_new_sessions,
            max_connections,
            max_sessions,
            &active_connections,
            &active_sessions,
        );

        if session.is_full_feature() && !session_counted {
            active_sessions.fetch_add(1, Ordering::AcqRel);
            session_counted = true;
        }

        let header_digest = session.params.header_digest == DigestType::CRC32C;
        let data_digest = session.params.data_digest == DigestType::CRC32C;

        match result {
            Ok(Some(response)) => {
                if let Err(e) = write_pdu(&mut stream, &response, header_digest, data_digest) {
                    log::warn!("connection {}: write error: {}", peer, e);
                    break;
                }
                if request.opcode == opcode::LOGOUT_REQUEST {
                    log::info!("connection {} logged out", peer);
                    break;
                }
            }
            Ok(None) => {
                // No response needed for this PDU (e.g. an unsolicited NOP-Out).
            }
            Err(e) => {
                log::warn!("connection {}: protocol error: {}", peer, e);
                break;
            }
        }
    }

    if session_counted {
        active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Route one incoming PDU to the session/SCSI layer and return the PDU to
/// send back, if any.
#[allow(clippy::too_many_arguments)]
fn dispatch<D: ScsiBlockDevice + Send + Sync + 'static>(
    session: &mut IscsiSession,
    request: &IscsiPdu,
    target_name: &str,
    bind_addr: &str,
    luns: &Arc<LuRegistry<D>>,
    accepting_new_sessions: &Arc<AtomicBool>,
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
    active_connections: &Arc<AtomicUsize>,
    active_sessions: &Arc<AtomicUsize>,
) -> ScsiResult<Option<IscsiPdu>> {
    if request.opcode != opcode::LOGIN_REQUEST && !session.is_full_feature() {
        return session.create_invalid_request_during_login_reject(request.itt).map(Some);
    }

    match request.opcode {
        opcode::LOGIN_REQUEST => {
            if session.state == crate::session::SessionState::Free {
                if !accepting_new_sessions.load(Ordering::Acquire) {
                    return session.create_shutdown_reject(request.itt).map(Some);
                }
                if let Some(limit) = max_connections {
                    if active_connections.load(Ordering::Acquire) > limit {
                        return session.create_too_many_connections_reject(request.itt).map(Some);
                    }
                }
                if let Some(limit) = max_sessions {
                    if active_sessions.load(Ordering::Acquire) >= limit {
                        return session.create_out_of_resources_reject(request.itt).map(Some);
                    }
                }
            }
            session.process_login(request, target_name).map(Some)
        }
        opcode::LOGOUT_REQUEST => session.process_logout(request).map(Some),
        opcode::NOP_OUT => match session.process_nop_out(request) {
            Ok(response) => Ok(Some(response)),
            Err(IscsiError::Protocol(_)) => Ok(None),
            Err(e) => Err(e),
        },
        opcode::TEXT_REQUEST => handle_text_request(session, request, target_name, bind_addr).map(Some),
        opcode::SCSI_COMMAND => handle_scsi_command(session, request, luns),
        opcode::SCSI_DATA_OUT => handle_scsi_data_out(session, request, luns),
        other => Err(IscsiError::Protocol(format!(
            "unexpected opcode 0x{:02x} outside login/full-feature flow",
            other
        ))),
    }
}

fn handle_text_request(
    session: &mut IscsiSession,
    request: &IscsiPdu,
    target_name: &str,
    bind_addr: &str,
) -> ScsiResult<IscsiPdu> {
    let text = request.parse_text_request()?;

    let wants_send_targets = text.parameters.iter().any(|(k, v)| k == "SendTargets" && (v == "All" || v == target_name));
    let response_params = if wants_send_targets {
        session.handle_send_targets(target_name, bind_addr)
    } else {
        Vec::new()
    };

    Ok(IscsiPdu::text_response(
        request.itt,
        0xFFFF_FFFF,
        session.next_stat_sn(),
        session.exp_cmd_sn,
        session.max_cmd_sn,
        true,
        pdu::serialize_text_parameters(&response_params),
    ))
}

/// Build a SCSI Response PDU with no sense data for a SCSI status.
fn scsi_status_response(session: &mut IscsiSession, itt: u32, status: u8) -> IscsiPdu {
    IscsiPdu::scsi_response(
        itt,
        session.next_stat_sn(),
        session.exp_cmd_sn,
        session.max_cmd_sn,
        status,
        0x00, // iSCSI response: command completed at target
        0,
        None,
    )
}

/// Look up the LU for a command's LUN; callers turn `None` into a
/// LOGICAL_UNIT_NOT_SUPPORTED SCSI Response.
fn find_lun<'a, D: ScsiBlockDevice>(luns: &'a LuRegistry<D>, lun: u64) -> Option<&'a Arc<LogicalUnit<D>>> {
    luns.get(&lun)
}

fn execute_scsi_command<D: ScsiBlockDevice + Send + Sync + 'static>(
    session: &mut IscsiSession,
    request: &IscsiPdu,
    cdb: &[u8; 16],
    lu: &LogicalUnit<D>,
    lun: u64,
    write_data: Option<Vec<u8>>,
) -> ScsiResult<IscsiPdu> {
    let initiator_key = format!("{:?}/{}", session.isid, session.params.initiator_name);
    let prior_sense = session.last_sense_by_lun.get(&lun).cloned();

    let (response, new_sense) = lu.execute(*cdb, write_data, initiator_key, prior_sense, CancelToken::new())?;

    match new_sense {
        Some(sense) => {
            session.last_sense_by_lun.insert(lun, sense);
        }
        None => {
            session.last_sense_by_lun.remove(&lun);
        }
    }

    if response.status == scsi_status::GOOD {
        if cdb[0] == crate::scsi::ScsiOpcode::Read10 as u8
            || cdb[0] == crate::scsi::ScsiOpcode::Read16 as u8
            || cdb[0] == crate::scsi::ScsiOpcode::Read6 as u8
            || cdb[0] == crate::scsi::ScsiOpcode::Read12 as u8
        {
            // Combine data and status into one Data-In PDU (phase collapse).
            Ok(IscsiPdu::scsi_data_in(
                request.itt,
                0xFFFF_FFFF,
                session.next_stat_sn(),
                session.exp_cmd_sn,
                session.max_cmd_sn,
                0,
                0,
                response.data,
                true,
                Some(scsi_status::GOOD),
            ))
        } else {
            Ok(scsi_status_response(session, request.itt, scsi_status::GOOD))
        }
    } else {
        let sense = response.sense.map(|s| s.to_bytes());
        Ok(IscsiPdu::scsi_response(
            request.itt,
            session.next_stat_sn(),
            session.exp_cmd_sn,
            session.max_cmd_sn,
            response.status,
            0x00,
            0,
            sense.as_deref(),
        ))
    }
}

fn handle_scsi_command<D: ScsiBlockDevice + Send + Sync + 'static>(
    session: &mut IscsiSession,
    request: &IscsiPdu,
    luns: &Arc<LuRegistry<D>>,
) -> ScsiResult<Option<IscsiPdu>> {
    let cmd = request.parse_scsi_command()?;
    let cmd_sn = BigEndian::read_u32(&request.specific[4..8]);
    if !session.validate_cmd_sn(cmd_sn) {
        log::warn!("CmdSN {} outside window [{}, {})", cmd_sn, session.exp_cmd_sn, session.max_cmd_sn);
    }

    if cmd.cdb[0] == crate::scsi::ScsiOpcode::ReportLuns as u8 {
        let mut lun_ids: Vec<u64> = luns.keys().copied().collect();
        lun_ids.sort_unstable();
        let response = ScsiHandler::handle_report_luns_for(&cmd.cdb, &lun_ids)?;
        let sense = response.sense.map(|s| s.to_bytes());
        return Ok(Some(IscsiPdu::scsi_response(
            request.itt,
            session.next_stat_sn(),
            session.exp_cmd_sn,
            session.max_cmd_sn,
            response.status,
            0x00,
            0,
            sense.as_deref(),
        )));
    }

    let lu = match find_lun(luns, cmd.lun) {
        Some(lu) => Arc::clone(lu),
        None => {
            let sense = crate::scsi::SenseData::new(
                crate::scsi::sense_key::ILLEGAL_REQUEST,
                crate::scsi::asc::LOGICAL_UNIT_NOT_SUPPORTED,
                0,
            );
            return Ok(Some(IscsiPdu::scsi_response(
                request.itt,
                session.next_stat_sn(),
                session.exp_cmd_sn,
                session.max_cmd_sn,
                scsi_status::CHECK_CONDITION,
                0x00,
                0,
                Some(&sense.to_bytes()),
            )));
        }
    };

    if cmd.write && cmd.expected_data_length as usize > request.data.len() {
        // Not all write data arrived with the command (ImmediateData=No or a
        // transfer larger than FirstBurstLength): solicit the remainder.
        let ttt = session.next_target_transfer_tag();
        let (lba, transfer_length) = ScsiHandler::parse_rw6_cdb(&cmd.cdb)
            .or_else(|| ScsiHandler::parse_rw10_cdb(&cmd.cdb))
            .or_else(|| ScsiHandler::parse_rw12_cdb(&cmd.cdb))
            .or_else(|| ScsiHandler::parse_rw16_cdb(&cmd.cdb))
            .ok_or_else(|| IscsiError::Scsi("not a READ/WRITE CDB".into()))?;
        let mut buffer = request.data.clone();
        buffer.resize(cmd.expected_data_length as usize, 0);
        let pending = PendingWrite {
            lba,
            transfer_length,
            block_size: lu.block_size()?,
            bytes_received: request.data.len() as u32,
            ttt,
            r2t_sn: 0,
            lun: cmd.lun,
            buffer,
        };
        session.pending_writes.insert(request.itt, pending);

        let r2t = IscsiPdu::r2t(
            request.itt,
            ttt,
            session.next_stat_sn(),
            session.exp_cmd_sn,
            session.max_cmd_sn,
            0,
            request.data.len() as u32,
            cmd.expected_data_length - request.data.len() as u32,
            cmd.lun,
        );
        return Ok(Some(r2t));
    }

    let write_data = if cmd.write { Some(request.data.clone()) } else { None };
    execute_scsi_command(session, request, &cmd.cdb, &lu, cmd.lun, write_data).map(Some)
}

fn handle_scsi_data_out<D: ScsiBlockDevice + Send + Sync + 'static>(
    session: &mut IscsiSession,
    request: &IscsiPdu,
    luns: &Arc<LuRegistry<D>>,
) -> ScsiResult<Option<IscsiPdu>> {
    let data_out = request.parse_scsi_data_out()?;

    {
        let pending = session
            .pending_writes
            .get_mut(&data_out.itt)
            .ok_or_else(|| IscsiError::Protocol(format!("Data-Out for unknown ITT {}", data_out.itt)))?;
        let offset = data_out.buffer_offset as usize;
        let end = offset + data_out.data.len();
        if end > pending.buffer.len() {
            return Err(IscsiError::Protocol("Data-Out overruns expected transfer length".into()));
        }
        pending.buffer[offset..end].copy_from_slice(&data_out.data);
        pending.bytes_received += data_out.data.len() as u32;
    }

    if !data_out.final_flag {
        return Ok(None);
    }

    let pending = session
        .pending_writes
        .remove(&data_out.itt)
        .ok_or_else(|| IscsiError::InternalAssertionFailure("pending write vanished mid-transfer".into()))?;

    let lu = match find_lun(luns, pending.lun) {
        Some(lu) => Arc::clone(lu),
        None => {
            return Err(IscsiError::Protocol(format!("Data-Out for unknown LUN {}", pending.lun)));
        }
    };

    let mut cdb = [0u8; 16];
    cdb[0] = if pending.lba > u32::MAX as u64 {
        crate::scsi::ScsiOpcode::Write16 as u8
    } else {
        crate::scsi::ScsiOpcode::Write10 as u8
    };
    if cdb[0] == crate::scsi::ScsiOpcode::Write10 as u8 {
        BigEndian::write_u32(&mut cdb[2..6], pending.lba as u32);
        BigEndian::write_u16(&mut cdb[7..9], (pending.transfer_length) as u16);
    } else {
        BigEndian::write_u64(&mut cdb[2..10], pending.lba);
        BigEndian::write_u32(&mut cdb[10..14], pending.transfer_length);
    }
    execute_scsi_command(session, request, &cdb, &lu, pending.lun, Some(pending.buffer)).map(Some)
}
