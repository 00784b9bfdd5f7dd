// src/ledger.rs
//
// =============================================================================
// TASKDRAIN: RESOURCE LEDGER (v 0.1)
// =============================================================================
//
// Tracks free/reserved CPU, RAM, GPU slots, GPU memory and disk, and issues
// Reservations against them under a single lock. GPUs remain board-wise
// (bitmask) allocation, not fractional, per the teacher's detection model;
// CPU/RAM/disk are counted sub-ledgers with a soft reserve floor.
//
// `try_reserve`/`release` are the admission-time Alloc/Release pair the
// Dispatcher calls around `Work`: a read-only `available()` snapshot alone
// cannot stop two concurrently-admitted tasks from both fitting against
// the same free capacity, so the actual reservation has to happen under
// the same lock the fit check reads.

use crate::model::{parse_bytes, Reservation, Resource};
use std::sync::Mutex;

const DEFAULT_SOFT_RESERVE_FRACTION: f64 = 0.15;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient {0}: requested allocation would breach the soft reserve")]
    Insufficient(&'static str),
    #[error("reservation device {given:?} does not match tracked device {tracked:?}")]
    ForeignDevice { given: String, tracked: String },
    #[error("ledger has not been initialized for device class {0:?}")]
    NoInit(&'static str),
}

/// One board's GPU capacity: total slots (boards) and memory per slot.
#[derive(Debug, Clone, Copy)]
pub struct GpuBoard {
    pub free_mem: u64,
    pub busy: bool,
}

struct Inner {
    device: String,
    total: u64,
    allocated: u64,
    soft_min_free: u64,
}

/// A disk-like sub-ledger: tracks `total`, `allocated`, and a soft reserve
/// floor recomputed on every `set_limits`.
struct DiskLedger {
    inner: Option<Inner>,
}

impl DiskLedger {
    fn new() -> Self {
        Self { inner: None }
    }

    /// `available` is the live free-space reading from the filesystem at
    /// the moment of the call. `min_free` is an operator-supplied floor;
    /// the effective floor is `max(min_free, 0.85 * available)`.
    fn set_limits(&mut self, device: &str, available: u64, min_free: u64) -> u64 {
        let soft_min_free = min_free.max((available as f64 * (1.0 - DEFAULT_SOFT_RESERVE_FRACTION)) as u64);
        let device_changed = self.inner.as_ref().map(|i| i.device != device).unwrap_or(true);
        self.inner = Some(Inner {
            device: device.to_string(),
            total: available,
            allocated: if device_changed { 0 } else { self.inner.as_ref().map(|i| i.allocated).unwrap_or(0) },
            soft_min_free,
        });
        soft_min_free
    }

    fn alloc(&mut self, available: u64, size: u64) -> Result<Reservation, LedgerError> {
        let inner = self.inner.as_mut().ok_or(LedgerError::NoInit("disk"))?;
        inner.total = available;
        let projected = inner
            .allocated
            .checked_add(size)
            .unwrap_or_else(|| panic!("ledger overflow: allocated + size overflowed u64"));
        let free_after = available.checked_sub(projected);
        match free_after {
            Some(free) if free > inner.soft_min_free => {}
            _ => return Err(LedgerError::Insufficient("disk")),
        }
        inner.allocated = projected;
        Ok(Reservation { device: inner.device.clone(), size })
    }

    fn release(&mut self, reservation: &Reservation) -> Result<(), LedgerError> {
        let inner = self.inner.as_mut().ok_or(LedgerError::NoInit("disk"))?;
        if inner.device != reservation.device {
            return Err(LedgerError::ForeignDevice {
                given: reservation.device.clone(),
                tracked: inner.device.clone(),
            });
        }
        inner.allocated = inner.allocated.saturating_sub(reservation.size);
        Ok(())
    }

    fn free(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.total.saturating_sub(i.allocated))
            .unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.inner.as_ref().map(|i| i.total).unwrap_or(0)
    }

    fn allocated(&self) -> u64 {
        self.inner.as_ref().map(|i| i.allocated).unwrap_or(0)
    }
}

/// A simple counting sub-ledger for CPU cores / RAM bytes: no soft reserve,
/// just `allocated <= total`.
struct CountingLedger {
    total: u64,
    allocated: u64,
}

impl CountingLedger {
    fn new(total: u64) -> Self {
        Self { total, allocated: 0 }
    }

    fn alloc(&mut self, size: u64) -> Result<(), LedgerError> {
        let projected = self
            .allocated
            .checked_add(size)
            .unwrap_or_else(|| panic!("ledger overflow: allocated + size overflowed u64"));
        if projected > self.total {
            return Err(LedgerError::Insufficient("cpu-or-ram"));
        }
        self.allocated = projected;
        Ok(())
    }

    fn release(&mut self, size: u64) {
        self.allocated = self.allocated.saturating_sub(size);
    }

    fn free(&self) -> u64 {
        self.total.saturating_sub(self.allocated)
    }
}

struct State {
    cpu: CountingLedger,
    ram: CountingLedger,
    disk: DiskLedger,
    gpu_boards: Vec<GpuBoard>,
}

/// A bundled grant across every resource class reserved for one admitted
/// task by `Ledger::try_reserve`, handed back verbatim to `Ledger::release`.
#[derive(Debug)]
pub struct LedgerGrant {
    cpus: u64,
    ram: u64,
    gpu_board: Option<usize>,
    disk: Option<Reservation>,
}

/// Process-wide singleton tracking every reservable resource on this node.
/// Initialized once at startup via `set_limits`/`set_gpu_boards`; queried
/// and mutated only through the typed operations below.
pub struct Ledger {
    state: Mutex<State>,
}

impl Ledger {
    pub fn new(total_cpus: u64, total_ram_bytes: u64) -> Self {
        Self {
            state: Mutex::new(State {
                cpu: CountingLedger::new(total_cpus),
                ram: CountingLedger::new(total_ram_bytes),
                disk: DiskLedger::new(),
                gpu_boards: Vec::new(),
            }),
        }
    }

    pub fn set_gpu_boards(&self, boards: Vec<GpuBoard>) {
        self.state.lock().unwrap().gpu_boards = boards;
    }

    /// §4.A `SetLimits`. `available` is the caller's freshly-sampled
    /// filesystem free-space reading for `device`.
    pub fn set_disk_limits(&self, device: &str, available: u64, min_free: u64) -> u64 {
        self.state.lock().unwrap().disk.set_limits(device, available, min_free)
    }

    /// §4.A `Alloc` for disk, re-reading `available` under the lock.
    pub fn alloc_disk(&self, available: u64, size: u64) -> Result<Reservation, LedgerError> {
        self.state.lock().unwrap().disk.alloc(available, size)
    }

    pub fn release_disk(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        self.state.lock().unwrap().disk.release(reservation)
    }

    pub fn alloc_cpus(&self, count: u64) -> Result<(), LedgerError> {
        self.state.lock().unwrap().cpu.alloc(count)
    }

    pub fn release_cpus(&self, count: u64) {
        self.state.lock().unwrap().cpu.release(count)
    }

    pub fn alloc_ram(&self, bytes: u64) -> Result<(), LedgerError> {
        self.state.lock().unwrap().ram.alloc(bytes)
    }

    pub fn release_ram(&self, bytes: u64) {
        self.state.lock().unwrap().ram.release(bytes)
    }

    /// The maximum free quantity over all boards — the quantity a single
    /// task may request (GPUs are allocated board-wise, never fractionally).
    pub fn largest_free_gpu_slots(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.gpu_boards.iter().filter(|b| !b.busy).count() as u64
    }

    pub fn largest_free_gpu_mem(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .gpu_boards
            .iter()
            .filter(|b| !b.busy)
            .map(|b| b.free_mem)
            .max()
            .unwrap_or(0)
    }

    /// Claims one free board with at least `min_mem` free memory.
    pub fn alloc_gpu_board(&self, min_mem: u64) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .gpu_boards
            .iter()
            .position(|b| !b.busy && b.free_mem >= min_mem)?;
        state.gpu_boards[idx].busy = true;
        Some(idx)
    }

    pub fn release_gpu_board(&self, idx: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(board) = state.gpu_boards.get_mut(idx) {
            board.busy = false;
        }
    }

    /// Current availability as a `Resource`, for fit-checking against a
    /// Subscription's `resourceHint` (§4.G step 3).
    pub fn available(&self) -> Resource {
        let state = self.state.lock().unwrap();
        Resource {
            cpus: state.cpu.free(),
            gpus: state.gpu_boards.iter().filter(|b| !b.busy).count() as u64,
            hdd: state.disk.free(),
            ram: state.ram.free(),
            gpu_mem: state
                .gpu_boards
                .iter()
                .filter(|b| !b.busy)
                .map(|b| b.free_mem)
                .max()
                .unwrap_or(0),
        }
    }

    /// §4.A `Alloc`: atomically checks `need` against current availability
    /// and reserves CPU, RAM, a GPU board and disk space in one locked pass.
    /// Closes the race a read-only `available()` snapshot leaves open,
    /// where two concurrently-admitted tasks could each pass a fit check
    /// against the same free capacity and oversubscribe the node. `None`
    /// means `need` does not fit; nothing is reserved in that case.
    pub fn try_reserve(&self, need: &Resource) -> Option<LedgerGrant> {
        let mut state = self.state.lock().unwrap();
        let have = Resource {
            cpus: state.cpu.free(),
            gpus: state.gpu_boards.iter().filter(|b| !b.busy).count() as u64,
            hdd: state.disk.free(),
            ram: state.ram.free(),
            gpu_mem: state.gpu_boards.iter().filter(|b| !b.busy).map(|b| b.free_mem).max().unwrap_or(0),
        };
        if !Resource::fits(need, &have) {
            return None;
        }

        state.cpu.alloc(need.cpus).ok()?;
        if state.ram.alloc(need.ram).is_err() {
            state.cpu.release(need.cpus);
            return None;
        }

        let gpu_board = if need.gpus > 0 {
            match state.gpu_boards.iter().position(|b| !b.busy && b.free_mem >= need.gpu_mem) {
                Some(idx) => {
                    state.gpu_boards[idx].busy = true;
                    Some(idx)
                }
                None => {
                    state.cpu.release(need.cpus);
                    state.ram.release(need.ram);
                    return None;
                }
            }
        } else {
            None
        };

        let disk = if need.hdd > 0 {
            let total = state.disk.total();
            match state.disk.alloc(total, need.hdd) {
                Ok(r) => Some(r),
                Err(_) => {
                    state.cpu.release(need.cpus);
                    state.ram.release(need.ram);
                    if let Some(idx) = gpu_board {
                        state.gpu_boards[idx].busy = false;
                    }
                    return None;
                }
            }
        } else {
            None
        };

        Some(LedgerGrant { cpus: need.cpus, ram: need.ram, gpu_board, disk })
    }

    /// Releases exactly what a prior `try_reserve` granted.
    pub fn release(&self, grant: LedgerGrant) {
        let mut state = self.state.lock().unwrap();
        state.cpu.release(grant.cpus);
        state.ram.release(grant.ram);
        if let Some(idx) = grant.gpu_board {
            if let Some(board) = state.gpu_boards.get_mut(idx) {
                board.busy = false;
            }
        }
        if let Some(reservation) = &grant.disk {
            let _ = state.disk.release(reservation);
        }
    }

    /// §4.A `Snapshot`: opaque observability document.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "cpu": { "total": state.cpu.total, "allocated": state.cpu.allocated },
            "ram": { "total": state.ram.total, "allocated": state.ram.allocated },
            "disk": { "total": state.disk.total(), "allocated": state.disk.allocated() },
            "gpu_boards": state.gpu_boards.len(),
            "gpu_boards_free": state.gpu_boards.iter().filter(|b| !b.busy).count(),
        })
    }
}

/// Parses a human byte string, re-exported at the ledger boundary since
/// every byte quantity entering a Reservation request flows through here.
pub fn parse_resource_bytes(raw: &str) -> Result<u64, crate::model::ByteParseError> {
    parse_bytes(raw)
}
