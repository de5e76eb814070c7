//! Typed image requests

use super::{DispatchLayer, ImageDispatcher};
use crate::aio_completion::{AioCompletion, AioType};

use bitflags::bitflags;
use bytes::Bytes;
use rbdio_common::types::total_length;
use rbdio_common::{Extents, ImageArea, IoOperations, QosFlags, SnapId};
use std::sync::{Arc, Weak};
use tracing::Span;

bitflags! {
    /// Per-request pipeline state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DispatchFlags: u64 {
        /// Extents address the crypto header area
        const CRYPTO_HEADER = 1 << 0;
        const QOS_IOPS = 1 << 1;
        const QOS_BPS = 1 << 2;
        const QOS_READ_IOPS = 1 << 3;
        const QOS_WRITE_IOPS = 1 << 4;
        const QOS_READ_BPS = 1 << 5;
        const QOS_WRITE_BPS = 1 << 6;
    }
}

impl DispatchFlags {
    /// Marker recording that a throttle already charged the request
    pub fn qos(flag: QosFlags) -> Self {
        Self::from_bits_truncate(flag.bits() << 1)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadFlags: u32 {
        /// Read extents exactly as given, even past the area end
        const DISABLE_CLIPPING = 1 << 0;
    }
}

/// Origin of a flush request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSource {
    User,
    Internal,
    Shutdown,
    WriteBlock,
    Writeback,
}

/// Request variant and payload
#[derive(Debug, Clone)]
pub enum Request {
    Read {
        read_flags: ReadFlags,
    },
    Write {
        data: Bytes,
    },
    Discard {
        discard_granularity: u32,
    },
    WriteSame {
        /// Pattern repeated over every extent
        data: Bytes,
    },
    CompareAndWrite {
        cmp_data: Bytes,
        data: Bytes,
    },
    Flush {
        flush_source: FlushSource,
    },
    ListSnaps {
        snap_ids: Vec<SnapId>,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Discard { .. } => "discard",
            Self::WriteSame { .. } => "write_same",
            Self::CompareAndWrite { .. } => "compare_and_write",
            Self::Flush { .. } => "flush",
            Self::ListSnaps { .. } => "list_snaps",
        }
    }

    /// Check if the request modifies image data
    pub fn is_write_op(&self) -> bool {
        matches!(
            self,
            Self::Write { .. }
                | Self::Discard { .. }
                | Self::WriteSame { .. }
                | Self::CompareAndWrite { .. }
        )
    }

    /// Operation kind for QoS exclusion; empty for unthrottled variants
    pub fn io_operation(&self) -> IoOperations {
        match self {
            Self::Read { .. } => IoOperations::READ,
            Self::Write { .. } => IoOperations::WRITE,
            Self::Discard { .. } => IoOperations::DISCARD,
            Self::WriteSame { .. } => IoOperations::WRITE_SAME,
            Self::CompareAndWrite { .. } => IoOperations::COMPARE_AND_WRITE,
            Self::Flush { .. } | Self::ListSnaps { .. } => IoOperations::empty(),
        }
    }

    pub fn aio_type(&self) -> AioType {
        match self {
            Self::Read { .. } => AioType::Read,
            Self::Write { .. } => AioType::Write,
            Self::Discard { .. } => AioType::Discard,
            Self::WriteSame { .. } => AioType::WriteSame,
            Self::CompareAndWrite { .. } => AioType::CompareAndWrite,
            Self::Flush { .. } => AioType::Flush,
            Self::ListSnaps { .. } => AioType::ListSnaps,
        }
    }
}

/// One image request travelling through the pipeline
pub struct ImageDispatchSpec {
    pub request: Request,
    pub image_extents: Extents,
    pub aio_comp: Arc<AioCompletion>,
    /// Trace context of the request
    pub trace: Span,
    /// Assigned on first send, 0 until then
    pub tid: u64,
    pub dispatch_flags: DispatchFlags,
    /// Last layer the request was offered to
    pub dispatch_layer: DispatchLayer,
    dispatcher: Weak<ImageDispatcher>,
}

impl ImageDispatchSpec {
    /// Build a request entering the pipeline after `layer`
    ///
    /// Requests created by a stage pass that stage's layer so they are only
    /// seen by the stages below it.
    pub fn new(
        dispatcher: Weak<ImageDispatcher>,
        layer: DispatchLayer,
        aio_comp: Arc<AioCompletion>,
        image_extents: Extents,
        area: ImageArea,
        request: Request,
    ) -> Box<Self> {
        let trace = tracing::debug_span!(
            "image_request",
            op = request.name(),
            tid = tracing::field::Empty
        );
        let dispatch_flags = match area {
            ImageArea::CryptoHeader => DispatchFlags::CRYPTO_HEADER,
            ImageArea::Data => DispatchFlags::empty(),
        };
        Box::new(Self {
            request,
            image_extents,
            aio_comp,
            trace,
            tid: 0,
            dispatch_flags,
            dispatch_layer: layer,
            dispatcher,
        })
    }

    /// Internal flush issued by a stage
    pub fn create_flush(
        dispatcher: Weak<ImageDispatcher>,
        layer: DispatchLayer,
        aio_comp: Arc<AioCompletion>,
        flush_source: FlushSource,
    ) -> Box<Self> {
        Self::new(
            dispatcher,
            layer,
            aio_comp,
            Vec::new(),
            ImageArea::Data,
            Request::Flush { flush_source },
        )
    }

    pub fn area(&self) -> ImageArea {
        if self.dispatch_flags.contains(DispatchFlags::CRYPTO_HEADER) {
            ImageArea::CryptoHeader
        } else {
            ImageArea::Data
        }
    }

    /// Check if this is the flush issued by dispatcher teardown
    pub fn is_shutdown_flush(&self) -> bool {
        matches!(
            self.request,
            Request::Flush {
                flush_source: FlushSource::Shutdown
            }
        )
    }

    pub fn total_length(&self) -> u64 {
        total_length(&self.image_extents)
    }

    /// Send the request, or continue routing after `dispatch_layer` if it
    /// was already routed
    pub fn send(self: Box<Self>) {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.send(self),
            None => self.fail(-libc::ESHUTDOWN),
        }
    }

    /// Complete the request with an error
    pub fn fail(self: Box<Self>, r: i32) {
        self.aio_comp.fail(r);
    }
}
