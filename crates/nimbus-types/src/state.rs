// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual machine states and the actions that drive transitions between
//! them.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The coarse lifecycle phase of a VM.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    #[default]
    Init = 0,
    Pending = 1,
    Hold = 2,
    Active = 3,
    Stopped = 4,
    Suspended = 5,
    Done = 6,
    Poweroff = 8,
    Undeployed = 9,
    Cloning = 10,
    CloningFailure = 11,
}

/// The fine-grained state of an `Active` VM. Outside of `Active` a VM is
/// always in `LcmInit`.
///
/// Every state naming an in-flight driver operation has a `*Failure`
/// counterpart (or returns to a stable state on failure); failure states are
/// left only through explicit recovery.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LcmState {
    #[default]
    LcmInit = 0,
    Prolog = 1,
    Boot = 2,
    Running = 3,
    Migrate = 4,
    SaveStop = 5,
    SaveSuspend = 6,
    SaveMigrate = 7,
    PrologMigrate = 8,
    PrologResume = 9,
    EpilogStop = 10,
    Epilog = 11,
    Shutdown = 12,
    CleanupResubmit = 15,
    Unknown = 16,
    Hotplug = 17,
    ShutdownPoweroff = 18,
    BootUnknown = 19,
    BootPoweroff = 20,
    BootSuspended = 21,
    BootStopped = 22,
    CleanupDelete = 23,
    HotplugSnapshot = 24,
    HotplugNic = 25,
    HotplugSaveas = 26,
    HotplugSaveasPoweroff = 27,
    HotplugSaveasSuspended = 28,
    ShutdownUndeploy = 29,
    EpilogUndeploy = 30,
    PrologUndeploy = 31,
    BootUndeploy = 32,
    HotplugPrologPoweroff = 33,
    HotplugEpilogPoweroff = 34,
    BootMigrate = 35,
    BootFailure = 36,
    BootMigrateFailure = 37,
    PrologMigrateFailure = 38,
    PrologFailure = 39,
    EpilogFailure = 40,
    EpilogStopFailure = 41,
    EpilogUndeployFailure = 42,
    PrologMigratePoweroff = 43,
    PrologMigratePoweroffFailure = 44,
    PrologMigrateSuspend = 45,
    PrologMigrateSuspendFailure = 46,
    BootUndeployFailure = 47,
    BootStoppedFailure = 48,
    PrologResumeFailure = 49,
    PrologUndeployFailure = 50,
    DiskSnapshotPoweroff = 51,
    DiskSnapshotRevertPoweroff = 52,
    DiskSnapshotDeletePoweroff = 53,
    DiskSnapshotSuspended = 54,
    DiskSnapshotRevertSuspended = 55,
    DiskSnapshotDeleteSuspended = 56,
    DiskSnapshot = 57,
    DiskSnapshotDelete = 59,
    PrologMigrateUnknown = 60,
    PrologMigrateUnknownFailure = 61,
    DiskResize = 62,
    DiskResizePoweroff = 63,
    DiskResizeUndeployed = 64,
    HotplugNicPoweroff = 65,
    HotplugResize = 66,
    HotplugSaveasUndeployed = 67,
    HotplugSaveasStopped = 68,
    Backup = 69,
    BackupPoweroff = 70,
    Restore = 71,
}

impl LcmState {
    /// Returns true for the `*_FAILURE` resting states that only operator
    /// recovery or retry can leave.
    pub fn is_failure(self) -> bool {
        use LcmState::*;
        matches!(
            self,
            BootFailure
                | BootMigrateFailure
                | PrologMigrateFailure
                | PrologFailure
                | EpilogFailure
                | EpilogStopFailure
                | EpilogUndeployFailure
                | PrologMigratePoweroffFailure
                | PrologMigrateSuspendFailure
                | BootUndeployFailure
                | BootStoppedFailure
                | PrologResumeFailure
                | PrologUndeployFailure
                | PrologMigrateUnknownFailure
        )
    }
}

/// The action recorded in a history record as the cause of a transition.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum VmAction {
    #[default]
    None,
    Migrate,
    LiveMigrate,
    PoffMigrate,
    PoffHardMigrate,
    Terminate,
    TerminateHard,
    Undeploy,
    UndeployHard,
    Hold,
    Release,
    Stop,
    Suspend,
    Resume,
    Boot,
    Delete,
    DeleteRecreate,
    Reboot,
    RebootHard,
    Resched,
    Unresched,
    Poweroff,
    PoweroffHard,
    DiskAttach,
    DiskDetach,
    NicAttach,
    NicDetach,
    DiskSnapshotCreate,
    DiskSnapshotDelete,
    DiskSnapshotRevert,
    DiskSaveas,
    DiskResize,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    Resize,
    Updateconf,
    Recover,
    Retry,
    Backup,
    BackupCancel,
    Restore,
    SgAttach,
    SgDetach,
    Deploy,
    Import,
}

/// Why a history record was closed.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryReason {
    #[default]
    None,
    Error,
    User,
}
