// src/server/dispatch.rs
//! Request dispatcher
//!
//! Classifies each inbound packet and routes it:
//!
//! - ChannelData and Send indications: relay path, no authentication,
//!   policed by the allocation's permissions
//! - Binding requests: answered directly with XOR-MAPPED-ADDRESS
//! - Allocate / Refresh / CreatePermission / ChannelBind: authenticated,
//!   then handed to the method handler
//!
//! Every response echoes the request's transaction ID and carries SOFTWARE
//! and FINGERPRINT; responses to verified requests are signed with the
//! long-term key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, trace};

use super::listener::ClientSink;
use super::ServerContext;
use crate::allocation::{AllocateOutcome, AllocateRequest, Allocation, FiveTuple};
use crate::auth::Verified;
use crate::error::{StunError, TurnError, TurnResult};
use crate::stun::{
    classify, Attribute, AttributeType, ChannelData, Message, MessageClass, MessageHeader, Method,
    PacketKind, PROTO_UDP,
};

impl ServerContext {
    /// Handle one packet from a client and write back the response, if any
    pub(crate) async fn serve(self: &Arc<Self>, raw: &[u8], five_tuple: FiveTuple, sink: &ClientSink) {
        if let Some(response) = self.handle_packet(raw, five_tuple, sink).await {
            if let Err(e) = sink.send(response).await {
                debug!("Failed to send response to {}: {}", five_tuple.client, e);
            }
        }
    }

    /// Process one packet, returning the encoded response to send back
    #[instrument(skip(self, raw, sink), fields(len = raw.len()), level = "trace")]
    pub(crate) async fn handle_packet(
        self: &Arc<Self>,
        raw: &[u8],
        five_tuple: FiveTuple,
        sink: &ClientSink,
    ) -> Option<Bytes> {
        match classify(raw) {
            PacketKind::ChannelData => {
                self.handle_channel_data(raw, &five_tuple).await;
                None
            }
            PacketKind::Stun => self.handle_stun(raw, five_tuple, sink).await,
            PacketKind::Unknown => {
                trace!("Dropping unrecognized packet from {}", five_tuple.client);
                None
            }
        }
    }

    async fn handle_stun(self: &Arc<Self>, raw: &[u8], five_tuple: FiveTuple, sink: &ClientSink) -> Option<Bytes> {
        let now = Instant::now();

        let request = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => return self.reject_undecodable(e, &five_tuple),
        };

        if let Err(e) = request.verify_fingerprint(raw) {
            debug!("Dropping message from {}: {}", five_tuple.client, e);
            return None;
        }

        let method = request.message_type.method;
        match request.message_type.class {
            MessageClass::Indication => {
                if method == Method::Send {
                    self.handle_send_indication(&request, &five_tuple, now).await;
                } else {
                    trace!("Ignoring {:?} indication from {}", method, five_tuple.client);
                }
                return None;
            }
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                trace!("Ignoring response from {}", five_tuple.client);
                return None;
            }
            MessageClass::Request => {}
        }

        match method {
            Method::Binding => self.encode(self.handle_binding_request(&request, &five_tuple), None),
            Method::Allocate | Method::Refresh | Method::CreatePermission | Method::ChannelBind => {
                let verified = match self.auth.verify(&request, raw, five_tuple.client, now) {
                    Ok(verified) => verified,
                    Err(e) => {
                        debug!("{:?} from {} rejected: {}", method, five_tuple.client, e);
                        return self.error_response(&request, &e, &five_tuple, None);
                    }
                };

                let result = match method {
                    Method::Allocate => {
                        self.handle_allocate_request(&request, &verified, five_tuple, sink, now)
                            .await
                    }
                    Method::Refresh => self.handle_refresh_request(&request, &verified, &five_tuple, now),
                    Method::CreatePermission => {
                        self.handle_create_permission_request(&request, &verified, &five_tuple, now)
                    }
                    _ => self.handle_channel_bind_request(&request, &verified, &five_tuple, now),
                };

                match result {
                    Ok(response) => self.encode(response, Some(verified.key.as_slice())),
                    Err(e) => {
                        debug!("{:?} from {} failed: {}", method, five_tuple.client, e);
                        self.error_response(
                            &request,
                            &e,
                            &five_tuple,
                            Some(verified.key.as_slice()),
                        )
                    }
                }
            }
            _ => {
                debug!("Unsupported method {:?} from {}", method, five_tuple.client);
                let error = TurnError::BadRequest(format!("unsupported method {:?}", method));
                self.error_response(&request, &error, &five_tuple, None)
            }
        }
    }

    /// A request whose header parsed but whose attributes did not gets an
    /// error response; anything else is dropped.
    fn reject_undecodable(&self, error: StunError, five_tuple: &FiveTuple) -> Option<Bytes> {
        let header: MessageHeader = match error.header() {
            Some(header) if header.message_type.class == MessageClass::Request => *header,
            _ => {
                trace!("Dropping malformed message from {}: {}", five_tuple.client, error);
                return None;
            }
        };

        debug!("Bad request from {}: {}", five_tuple.client, error);
        let request = Message::new(header.message_type, header.transaction_id);
        self.error_response(&request, &TurnError::Stun(error), five_tuple, None)
    }

    fn encode(&self, response: Message, key: Option<&[u8]>) -> Option<Bytes> {
        let response = response.with(Attribute::software(self.software.clone()));
        match response.encode(key, true) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                debug!("Failed to encode response: {}", e);
                None
            }
        }
    }

    fn error_response(
        &self,
        request: &Message,
        error: &TurnError,
        five_tuple: &FiveTuple,
        key: Option<&[u8]>,
    ) -> Option<Bytes> {
        let (code, reason) = error.error_code()?;

        let mut response = Message::new(request.message_type.error(), request.transaction_id)
            .with(Attribute::error_code(code, reason));

        if let TurnError::Stun(StunError::UnknownAttributes { attrs, .. }) = error {
            response.add_attribute(Attribute::unknown_attributes(attrs.clone()));
        }

        if error.needs_challenge() {
            for attribute in self.auth.challenge(five_tuple.client.ip(), Instant::now()) {
                response.add_attribute(attribute);
            }
            return self.encode(response, None);
        }

        self.encode(response, key)
    }

    fn handle_binding_request(&self, request: &Message, five_tuple: &FiveTuple) -> Message {
        trace!("Binding request from {}", five_tuple.client);
        Message::new(request.message_type.success(), request.transaction_id)
            .with(Attribute::xor_mapped_address(five_tuple.client))
    }

    /// Handle ALLOCATE request (RFC 5766 Section 6)
    async fn handle_allocate_request(
        self: &Arc<Self>,
        request: &Message,
        verified: &Verified,
        five_tuple: FiveTuple,
        sink: &ClientSink,
        now: Instant,
    ) -> TurnResult<Message> {
        if request.has_attribute(AttributeType::ReservationToken) {
            return Err(TurnError::BadRequest("RESERVATION-TOKEN is not supported".into()));
        }

        let protocol = request
            .requested_transport()
            .ok_or_else(|| TurnError::BadRequest("missing REQUESTED-TRANSPORT".into()))?;
        if protocol != PROTO_UDP {
            return Err(TurnError::UnsupportedTransport(protocol));
        }

        let allocate = AllocateRequest {
            five_tuple,
            username: &verified.username,
            protocol,
            lifetime: request.lifetime().map(|secs| Duration::from_secs(secs.into())),
            address_family: request.requested_address_family(),
        };

        let outcome = self
            .allocations
            .allocate(allocate, self.relay.as_ref(), now)
            .await?;

        if let AllocateOutcome::Created(allocation) = &outcome {
            self.spawn_relay(allocation.clone(), sink.clone());
        }

        let allocation = outcome.allocation();
        Ok(Message::new(request.message_type.success(), request.transaction_id)
            .with(Attribute::xor_relayed_address(allocation.relay_addr()))
            .with(Attribute::lifetime(lifetime_secs(allocation.remaining(now))))
            .with(Attribute::xor_mapped_address(five_tuple.client)))
    }

    /// Live allocation of `five_tuple`, created by the verified user
    fn owned_allocation(
        &self,
        verified: &Verified,
        five_tuple: &FiveTuple,
        now: Instant,
    ) -> TurnResult<Arc<Allocation>> {
        let allocation = self
            .allocations
            .lookup_by_client(five_tuple, now)
            .ok_or_else(|| TurnError::AllocationMismatch(format!("no allocation for {}", five_tuple)))?;

        if allocation.username() != verified.username {
            return Err(TurnError::WrongCredentials {
                owner: allocation.username().to_string(),
            });
        }
        Ok(allocation)
    }

    /// Handle REFRESH request (RFC 5766 Section 7)
    fn handle_refresh_request(
        &self,
        request: &Message,
        verified: &Verified,
        five_tuple: &FiveTuple,
        now: Instant,
    ) -> TurnResult<Message> {
        self.owned_allocation(verified, five_tuple, now)?;

        let requested = request.lifetime().map(|secs| Duration::from_secs(secs.into()));
        let granted = self.allocations.refresh(five_tuple, requested, now)?;

        Ok(Message::new(request.message_type.success(), request.transaction_id)
            .with(Attribute::lifetime(lifetime_secs(granted))))
    }

    /// Handle CREATE-PERMISSION request (RFC 5766 Section 9)
    fn handle_create_permission_request(
        &self,
        request: &Message,
        verified: &Verified,
        five_tuple: &FiveTuple,
        now: Instant,
    ) -> TurnResult<Message> {
        let allocation = self.owned_allocation(verified, five_tuple, now)?;

        let peers = request.peer_addresses();
        if peers.is_empty() {
            return Err(TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()));
        }

        let relay_v4 = allocation.relay_addr().is_ipv4();
        if let Some(peer) = peers.iter().find(|peer| peer.is_ipv4() != relay_v4) {
            return Err(TurnError::PeerAddressFamilyMismatch(*peer));
        }

        for peer in &peers {
            allocation.create_permission(peer.ip(), now);
            debug!("Permission {} -> {} installed", allocation.relay_addr(), peer.ip());
        }

        Ok(Message::new(request.message_type.success(), request.transaction_id))
    }

    /// Handle CHANNEL-BIND request (RFC 5766 Section 11)
    fn handle_channel_bind_request(
        &self,
        request: &Message,
        verified: &Verified,
        five_tuple: &FiveTuple,
        now: Instant,
    ) -> TurnResult<Message> {
        let allocation = self.owned_allocation(verified, five_tuple, now)?;

        let channel = request
            .channel_number()
            .ok_or_else(|| TurnError::BadRequest("missing CHANNEL-NUMBER".into()))?;
        let peer = request
            .address(AttributeType::XorPeerAddress)
            .ok_or_else(|| TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()))?;

        if peer.is_ipv4() != allocation.relay_addr().is_ipv4() {
            return Err(TurnError::PeerAddressFamilyMismatch(peer));
        }

        allocation.bind_channel(channel, peer, now)?;
        info!("Channel 0x{:04X} bound: {} -> {}", channel, allocation.relay_addr(), peer);

        Ok(Message::new(request.message_type.success(), request.transaction_id))
    }

    /// Client → peer via Send indication (RFC 5766 Section 10.2)
    async fn handle_send_indication(&self, indication: &Message, five_tuple: &FiveTuple, now: Instant) {
        let Some(allocation) = self.allocations.lookup_by_client(five_tuple, now) else {
            trace!("Send indication from {} without allocation", five_tuple.client);
            return;
        };

        let (Some(peer), Some(data)) = (
            indication.address(AttributeType::XorPeerAddress),
            indication.data(),
        ) else {
            trace!("Send indication from {} missing peer or data", five_tuple.client);
            return;
        };

        if let Err(e) = allocation.send_to_peer(data, peer, now).await {
            trace!("Send indication to {} dropped: {}", peer, e);
        }
    }

    /// Client → peer via ChannelData (RFC 5766 Section 11.6)
    async fn handle_channel_data(&self, raw: &[u8], five_tuple: &FiveTuple) {
        let now = Instant::now();

        let frame = match ChannelData::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Dropping ChannelData from {}: {}", five_tuple.client, e);
                return;
            }
        };

        let Some(allocation) = self.allocations.lookup_by_client(five_tuple, now) else {
            trace!("ChannelData from {} without allocation", five_tuple.client);
            return;
        };

        let Some(peer) = allocation.peer_for_channel(frame.channel, now) else {
            trace!("ChannelData on unbound channel 0x{:04X}", frame.channel);
            return;
        };

        if let Err(e) = allocation.send_to_peer(&frame.data, peer, now).await {
            trace!("ChannelData to {} dropped: {}", peer, e);
        }
    }
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}
