use ember_mem::SpaceId;

use crate::handle::HandleTable;
use crate::object::ObjectId;
use crate::thread::ExitInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Loading,
    Running,
    Exiting,
    Dead,
}

impl ProcessState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ProcessState::Loading => 0,
            ProcessState::Running => 1,
            ProcessState::Exiting => 2,
            ProcessState::Dead => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ProcessState::Loading),
            1 => Some(ProcessState::Running),
            2 => Some(ProcessState::Exiting),
            3 => Some(ProcessState::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Process {
    pub(crate) space: SpaceId,
    pub(crate) handles: HandleTable,
    /// Owned threads in creation order.
    pub(crate) threads: Vec<ObjectId>,
    /// The thread whose death ends the process.
    pub(crate) primary: Option<ObjectId>,
    pub(crate) state: ProcessState,
    pub(crate) exit: Option<ExitInfo>,
    pub(crate) exe_path: String,
    pub(crate) cmdline: String,
}

impl Process {
    pub(crate) fn new(space: SpaceId, handles: HandleTable, exe_path: String, cmdline: String) -> Self {
        Self {
            space,
            handles,
            threads: Vec::new(),
            primary: None,
            state: ProcessState::Loading,
            exit: None,
            exe_path,
            cmdline,
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn threads(&self) -> &[ObjectId] {
        &self.threads
    }

    pub fn primary_thread(&self) -> Option<ObjectId> {
        self.primary
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    pub fn exe_path(&self) -> &str {
        &self.exe_path
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }
}
