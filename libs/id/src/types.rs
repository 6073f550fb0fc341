//! Typed ID definitions for all control-plane resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Logical Resources
// =============================================================================

define_id!(RouterId, "rtr");
define_id!(RouterTypeId, "rtt");

// =============================================================================
// Hosting Devices
// =============================================================================

define_id!(DeviceId, "hd");
define_id!(TemplateId, "hdt");

// =============================================================================
// Tenancy and Requests
// =============================================================================

define_id!(TenantId, "tnt");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
