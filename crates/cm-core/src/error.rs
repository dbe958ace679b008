// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stable wire-level serialization of domain error codes for cross-process
//! RPC returns.
//!
//! Zero is reserved for "no error" so the happy path never needs a sentinel
//! check against a real error value; any serialized value outside the valid
//! range is treated as memory corruption or a protocol break and is fatal,
//! not recoverable.

use std::fmt;

/// An error enum usable with [`ErrorSerializer`].
///
/// Implementors must use a signed integer representation wide enough to
/// hold every variant, with `INVALID` at `0` and `NUM_ENUM_ELEMENTS`
/// strictly greater than every valid code.
pub trait ErrorCode: Copy + Eq + fmt::Debug {
    /// Sentinel meaning "not a real error code"; always serializes to `0`.
    const INVALID: i32;
    /// One past the largest valid code; used as an upper bound check.
    const NUM_ENUM_ELEMENTS: i32;

    /// This code's wire value.
    fn to_i32(self) -> i32;
    /// Construct from a wire value already known to be in range.
    ///
    /// # Panics
    ///
    /// Implementations may panic if `value` does not correspond to a known
    /// variant; callers must only invoke this after range-checking via
    /// [`ErrorSerializer::deserialize`].
    fn from_i32(value: i32) -> Self;
}

/// Serializes a value from an error enum (or "no error") into a single
/// signed integer suitable for cross-process RPC returns.
pub struct ErrorSerializer<E>(std::marker::PhantomData<E>);

impl<E: ErrorCode> ErrorSerializer<E> {
    /// Serialize "no error".
    #[must_use]
    pub fn serialize_success() -> i32 {
        0
    }

    /// Serialize an error code.
    ///
    /// # Panics
    ///
    /// Panics if `error_code` is not strictly between `INVALID` and
    /// `NUM_ENUM_ELEMENTS` — this is a precondition violation, not a
    /// recoverable error.
    #[must_use]
    pub fn serialize_error(error_code: E) -> i32 {
        let value = error_code.to_i32();
        assert!(
            value > E::INVALID && value < E::NUM_ENUM_ELEMENTS,
            "error code {error_code:?} ({value}) outside valid range ({}, {})",
            E::INVALID,
            E::NUM_ENUM_ELEMENTS
        );
        value
    }

    /// Deserialize a wire value into `Ok(())` (no error) or `Err(code)`.
    ///
    /// # Panics
    ///
    /// Panics if `serialized` is outside `[INVALID, NUM_ENUM_ELEMENTS)` —
    /// this indicates corruption or a protocol break, and is fatal by
    /// design.
    pub fn deserialize(serialized: i32) -> Result<(), E> {
        assert!(
            serialized >= E::INVALID && serialized < E::NUM_ENUM_ELEMENTS,
            "serialized error code {serialized} outside valid range [{}, {})",
            E::INVALID,
            E::NUM_ENUM_ELEMENTS
        );
        if serialized == 0 {
            Ok(())
        } else {
            Err(E::from_i32(serialized))
        }
    }
}

/// Errors returned by Communication Management (CM) API operations.
///
/// Mirrors the AUTOSAR-style `ComErrc` error domain: a flat, stable list of
/// codes covering configuration, entity, transport, data, and resource
/// failures that can occur during service discovery, offer/find, and
/// method/event handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ComErrc {
    /// Reserved; never produced as a real error. Represents "no error" when serialized.
    Invalid = 0,
    /// Service is not available.
    ServiceNotAvailable = 1,
    /// Application holds more samples than committed in `Subscribe`.
    MaxSamplesReached,
    /// Local failure detected by the binding (e.g. filesystem/watcher failure).
    BindingFailure,
    /// Peer process is unreachable.
    PeerUnreachable,
    /// Field value is not valid.
    FieldValueInvalid,
    /// A required handler was never registered.
    HandlerNotSet,
    /// Allocation for a sample failed.
    AllocationFailure,
    /// Allocation was illegally performed outside the shared-memory allocator.
    IllegalUseOfAllocate,
    /// Service instance is not currently offered.
    ServiceNotOffered,
    /// Communication link is broken.
    CommunicationLinkError,
    /// No clients are connected.
    NoClients,
    /// Requested subscriber count exceeds the configured maximum.
    MaxSubscribersExceeded,
    /// A `FindServiceHandle` passed to `StopFindService` was invalid.
    InvalidHandle,
    /// Internal binding information was invalid.
    InvalidBindingInfo,
    /// Requested event does not exist on the provider side.
    EventNotExisting,
    /// Operation requires a subscription that was never made.
    NotSubscribed,
    /// Static configuration was invalid.
    InvalidConfiguration,
    /// A meta-model shortname did not meet naming requirements.
    InvalidMetaModelShortname,
    /// `OfferService` was called for an instance already offered.
    InstanceAlreadyOffered,
    /// Could not restart a proxy after a previous crash.
    CouldNotRestartProxy,
    /// Event/field/method has not been offered yet.
    NotOffered,
    /// An `InstanceSpecifier` could not be resolved to an `InstanceIdentifier`.
    InstanceIdUnresolved,
    /// `StartFindService` failed to register its handler.
    FindServiceHandlerFailure,
    /// One past the last valid code; never itself a valid error.
    NumEnumElements,
}

impl ErrorCode for ComErrc {
    const INVALID: i32 = 0;
    const NUM_ENUM_ELEMENTS: i32 = ComErrc::NumEnumElements as i32;

    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Self {
        match value {
            1 => ComErrc::ServiceNotAvailable,
            2 => ComErrc::MaxSamplesReached,
            3 => ComErrc::BindingFailure,
            4 => ComErrc::PeerUnreachable,
            5 => ComErrc::FieldValueInvalid,
            6 => ComErrc::HandlerNotSet,
            7 => ComErrc::AllocationFailure,
            8 => ComErrc::IllegalUseOfAllocate,
            9 => ComErrc::ServiceNotOffered,
            10 => ComErrc::CommunicationLinkError,
            11 => ComErrc::NoClients,
            12 => ComErrc::MaxSubscribersExceeded,
            13 => ComErrc::InvalidHandle,
            14 => ComErrc::InvalidBindingInfo,
            15 => ComErrc::EventNotExisting,
            16 => ComErrc::NotSubscribed,
            17 => ComErrc::InvalidConfiguration,
            18 => ComErrc::InvalidMetaModelShortname,
            19 => ComErrc::InstanceAlreadyOffered,
            20 => ComErrc::CouldNotRestartProxy,
            21 => ComErrc::NotOffered,
            22 => ComErrc::InstanceIdUnresolved,
            23 => ComErrc::FindServiceHandlerFailure,
            other => unreachable!("from_i32 called with out-of-range value {other}"),
        }
    }
}

impl fmt::Display for ComErrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ComErrc::Invalid => "no error",
            ComErrc::ServiceNotAvailable => "service is not available",
            ComErrc::MaxSamplesReached => "application holds more samples than committed in Subscribe",
            ComErrc::BindingFailure => "local failure detected by the binding",
            ComErrc::PeerUnreachable => "peer is unreachable",
            ComErrc::FieldValueInvalid => "field value is not valid",
            ComErrc::HandlerNotSet => "handler has not been registered",
            ComErrc::AllocationFailure => "sample allocation failure",
            ComErrc::IllegalUseOfAllocate => "allocation illegally done outside the shared-memory allocator",
            ComErrc::ServiceNotOffered => "service not offered",
            ComErrc::CommunicationLinkError => "communication link is broken",
            ComErrc::NoClients => "no clients connected",
            ComErrc::MaxSubscribersExceeded => "subscriber count exceeded",
            ComErrc::InvalidHandle => "StopFindService called with invalid FindServiceHandle",
            ComErrc::InvalidBindingInfo => "internal error: binding information invalid",
            ComErrc::EventNotExisting => "requested event does not exist on sender side",
            ComErrc::NotSubscribed => "event proxy is not subscribed to the event",
            ComErrc::InvalidConfiguration => "invalid configuration",
            ComErrc::InvalidMetaModelShortname => "meta model shortname does not adhere to naming requirements",
            ComErrc::InstanceAlreadyOffered => "service instance is already offered",
            ComErrc::CouldNotRestartProxy => "could not recreate proxy after previous crash",
            ComErrc::NotOffered => "event/field has not been offered yet",
            ComErrc::InstanceIdUnresolved => "could not resolve a valid InstanceIdentifier",
            ComErrc::FindServiceHandlerFailure => "StartFindService failed to register handler",
            ComErrc::NumEnumElements => "unknown future error",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for ComErrc {}

/// Result alias for operations returning a [`ComErrc`] on failure.
pub type ComResult<T> = Result<T, ComErrc>;

/// Errors specific to method call dispatch, serialized with the same codec.
///
/// Kept as a second error domain to demonstrate [`ErrorSerializer`] is
/// reusable across more than one error enum, one instantiation per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MethodErrc {
    /// Reserved; represents "no error" when serialized.
    Invalid = 0,
    /// Communication link to the method provider is broken.
    CommunicationLinkError = 1,
    /// Method's owning service is not available.
    ServiceNotAvailable,
    /// Method's owning service is not currently offered.
    ServiceNotOffered,
    /// One past the last valid code.
    NumEnumElements,
}

impl ErrorCode for MethodErrc {
    const INVALID: i32 = 0;
    const NUM_ENUM_ELEMENTS: i32 = MethodErrc::NumEnumElements as i32;

    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Self {
        match value {
            1 => MethodErrc::CommunicationLinkError,
            2 => MethodErrc::ServiceNotAvailable,
            3 => MethodErrc::ServiceNotOffered,
            other => unreachable!("from_i32 called with out-of-range value {other}"),
        }
    }
}

impl fmt::Display for MethodErrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MethodErrc::Invalid => "no error",
            MethodErrc::CommunicationLinkError => "communication link is broken",
            MethodErrc::ServiceNotAvailable => "service is not available",
            MethodErrc::ServiceNotOffered => "service is not offered",
            MethodErrc::NumEnumElements => "unknown future error",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for MethodErrc {}

/// Internal error type used by the crawler and discovery client before a
/// result crosses the process boundary as a serialized [`ComErrc`].
///
/// Carries the underlying cause (I/O error, etc.) for logging, which
/// `ComErrc` itself cannot since it is just a wire code.
#[derive(Debug)]
pub enum CoreError {
    /// Watcher or filesystem I/O failure that exhausted its retry budget.
    BindingFailure(String),
    /// Flag-file creation failed (instance already offered, or I/O error).
    ServiceNotOffered(String),
    /// `StopFindService`/`StopOfferService` referenced an unknown handle or instance.
    InvalidHandle(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::BindingFailure(msg) => write!(f, "binding failure: {msg}"),
            CoreError::ServiceNotOffered(msg) => write!(f, "service not offered: {msg}"),
            CoreError::InvalidHandle(msg) => write!(f, "invalid handle: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CoreError> for ComErrc {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::BindingFailure(_) => ComErrc::BindingFailure,
            CoreError::ServiceNotOffered(_) => ComErrc::ServiceNotOffered,
            CoreError::InvalidHandle(_) => ComErrc::InvalidHandle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_com_errc() -> Vec<ComErrc> {
        (1..ComErrc::NumEnumElements as i32).map(ComErrc::from_i32).collect()
    }

    #[test]
    fn round_trips_every_valid_code() {
        for code in all_com_errc() {
            let wire = ErrorSerializer::<ComErrc>::serialize_error(code);
            assert_eq!(ErrorSerializer::<ComErrc>::deserialize(wire), Err(code));
        }
    }

    #[test]
    fn success_round_trips_to_ok() {
        let wire = ErrorSerializer::<ComErrc>::serialize_success();
        assert_eq!(wire, 0);
        assert_eq!(ErrorSerializer::<ComErrc>::deserialize(wire), Ok(()));
    }

    #[test]
    fn deserialize_zero_is_always_ok() {
        assert_eq!(ErrorSerializer::<ComErrc>::deserialize(0), Ok(()));
    }

    #[test]
    #[should_panic(expected = "outside valid range")]
    fn serialize_invalid_terminates() {
        ErrorSerializer::<ComErrc>::serialize_error(ComErrc::Invalid);
    }

    #[test]
    #[should_panic(expected = "outside valid range")]
    fn serialize_num_enum_elements_terminates() {
        ErrorSerializer::<ComErrc>::serialize_error(ComErrc::NumEnumElements);
    }

    #[test]
    #[should_panic(expected = "outside valid range")]
    fn deserialize_num_enum_elements_terminates() {
        let _ = ErrorSerializer::<ComErrc>::deserialize(ComErrc::NumEnumElements as i32);
    }

    #[test]
    fn core_error_maps_to_wire_code() {
        let err: ComErrc = CoreError::BindingFailure("watch add failed".into()).into();
        assert_eq!(err, ComErrc::BindingFailure);
    }

    #[test]
    fn method_errc_round_trips() {
        let wire = ErrorSerializer::<MethodErrc>::serialize_error(MethodErrc::ServiceNotOffered);
        assert_eq!(
            ErrorSerializer::<MethodErrc>::deserialize(wire),
            Err(MethodErrc::ServiceNotOffered)
        );
    }
}
