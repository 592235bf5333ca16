//! Custom resources consumed by the SSP operator
//!
//! These CRDs are installed by other components. The operator only reads
//! them, and only while their CRD is present in the cluster.

mod virtual_machine;


pub use virtual_machine::{
    DataVolumeSource, PersistentVolumeClaimSource, VirtualMachine, VirtualMachineInstanceSpec,
    VirtualMachineInstanceTemplate, VirtualMachineSpec, VirtualMachineStatus, Volume,
    PRINTABLE_STATUS_PROVISIONING, VIRTUAL_MACHINE_CRD,
};
