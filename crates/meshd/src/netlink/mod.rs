// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux netlink transport.
//!
//! One multiplexed socket per kernel protocol, request/response
//! correlation by sequence number, per-request ack timeout, multi-message
//! batching, dump discrimination, multicast-group dispatch and dynamic
//! receive-buffer growth.

pub mod attr;
pub mod link;
pub mod message;
pub mod proto;

pub use attr::{
    nlmsg_align, AttrIter, MessageIter, NlAttr, NlMsgHdr, NLA_HDRLEN, NLMSG_DONE, NLMSG_ERROR,
    NLMSG_HDRLEN, NLMSG_NOOP, NLM_F_ACK, NLM_F_DUMP, NLM_F_MULTI, NLM_F_REQUEST,
};
pub use link::{derive_port_id, KernelLink, NetlinkLink};
pub use message::{HandlerId, MessageTooLarge, NetlinkMessage, RESULT_PENDING};
pub use proto::{NetlinkCore, NetlinkHandler, NetlinkHandlerSpec};
