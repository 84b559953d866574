//! Process attribution for flows

use flowscope_common::Tuple;

/// Direction of traffic relative to the process owning the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

impl TrafficDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficDirection::Inbound => "inbound",
            TrafficDirection::Outbound => "outbound",
        }
    }
}

/// Socket statistics sampled by the process info source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStatsData {
    pub send_congestion_wnd: u32,
    pub smooth_rtt: u32,
    pub min_rtt: u32,
    pub mss: u32,
    pub total_retrans: u64,
    pub lost_out: u64,
    pub unrecovered_rto: u64,
    /// Set when the sample has not been copied into a flow yet.
    pub is_dirty: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub tuple: Option<Tuple>,
    pub name: String,
    pub pid: u32,
    pub arguments: String,
    pub tcp_stats: TcpStatsData,
}

/// Lookup of the process owning one side of a flow.
pub trait ProcessInfoCache: Send + Sync {
    fn lookup(&self, tuple: &Tuple, direction: TrafficDirection) -> Option<ProcessInfo>;

    /// Mark the TCP statistics for `tuple` as consumed (`dirty == false`).
    fn update(&self, tuple: &Tuple, dirty: bool);
}

/// Cache that never knows any process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NilProcessInfoCache;

impl ProcessInfoCache for NilProcessInfoCache {
    fn lookup(&self, _tuple: &Tuple, _direction: TrafficDirection) -> Option<ProcessInfo> {
        None
    }

    fn update(&self, _tuple: &Tuple, _dirty: bool) {}
}
