use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::headers::Vid;
use crate::sim::{SimFlash, StubEba, StubFastmap, StubSqnum, StubVolume, StubVolumes};
use crate::{Config, Error, IoError, LebCopyError, VolType};

const PEB_SIZE: usize = 2048;
const VID_OFF: usize = 64;
const LEB_START: usize = 512;

fn test_cfg(peb_count: u32) -> Config {
    Config::new(peb_count, PEB_SIZE, VID_OFF, LEB_START, 1)
}

fn attach_info(used: &[(u32, u64)], free: &[(u32, u64)], avail: usize) -> AttachInfo {
    let max_ec = used
        .iter()
        .chain(free)
        .map(|&(_, ec)| ec)
        .max()
        .unwrap_or(0);
    AttachInfo {
        max_ec,
        avail_pebs: avail,
        used: used
            .iter()
            .map(|&(pnum, ec)| UsedPebScan {
                pnum,
                ec,
                scrub: false,
                consolidated: false,
            })
            .collect(),
        free: free.iter().map(|&(pnum, ec)| PebScan { pnum, ec }).collect(),
        ..Default::default()
    }
}

struct Harness {
    flash: Arc<SimFlash>,
    eba: Arc<StubEba>,
    dev: Arc<UbiWl>,
}

impl Harness {
    fn new(
        cfg: Config,
        attach: AttachInfo,
        flash: Arc<SimFlash>,
        vols: Arc<StubVolumes>,
        eba: Arc<StubEba>,
    ) -> Self {
        Self::with_fastmap(cfg, attach, flash, vols, eba, None)
    }

    fn with_fastmap(
        cfg: Config,
        attach: AttachInfo,
        flash: Arc<SimFlash>,
        vols: Arc<StubVolumes>,
        eba: Arc<StubEba>,
        fastmap: Option<Arc<StubFastmap>>,
    ) -> Self {
        let dev = UbiWl::init(
            cfg,
            attach,
            Arc::clone(&flash) as Arc<dyn crate::FlashIo>,
            Arc::clone(&eba) as Arc<dyn crate::Eba>,
            vols as Arc<dyn crate::Volumes>,
            StubSqnum::new() as Arc<dyn crate::SqnumSource>,
            fastmap.map(|fm| fm as Arc<dyn crate::Fastmap>),
        )
        .unwrap();
        Self { flash, eba, dev }
    }

    fn wait_idle(&self) {
        let _ = self.dev.flush_work();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.dev.close(None);
    }
}

fn stage_used(flash: &SimFlash, vol: &StubVolume, pnum: u32, ec: u64, lnum: u32) {
    flash.format_peb(pnum, ec);
    flash.program_vid(
        pnum,
        &[Vid {
            vol_id: vol.vol_id(),
            lnum,
            ..Default::default()
        }],
    );
    flash.program_data(pnum, 0, &[0xAB; 32]);
    vol.map_leb(lnum, pnum);
}

/// One used PEB at EC 0, plenty of free PEBs at EC 5000: exactly one
/// wear-leveling move runs, the EBA is re-pointed and the source comes back
/// erased.
#[test]
fn test_wear_trigger_moves_min_used() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 5000)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.wait_idle();

    let target = vol.mapping(0).expect("LEB must stay mapped");
    assert_ne!(target, 0);
    assert_eq!(h.eba.copies(), vec![(0, target, 1)]);
    assert_eq!(h.dev.test_location(target), Some(Location::Used));
    assert_eq!(h.dev.test_location(0), Some(Location::Free));
    assert_eq!(h.flash.ec_of(0), Some(1));
    assert_eq!(h.dev.free_count(), 8);
    assert!(!h.dev.test_wl_scheduled());
}

/// EC spread below the threshold: the trigger does not fire.
#[test]
fn test_below_threshold_no_move() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.dev.ensure_wl().unwrap();
    h.wait_idle();

    assert!(h.eba.copies().is_empty());
    assert!(!h.dev.test_wl_scheduled());
    assert_eq!(h.dev.test_location(0), Some(Location::Used));
}

/// Scrubbing moves the PEB regardless of erase-counter difference.
#[test]
fn test_scrub_entry_moves_regardless_of_ec() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.dev.scrub_peb(0).unwrap();
    h.wait_idle();

    let target = vol.mapping(0).unwrap();
    assert_eq!(h.eba.copies(), vec![(0, target, 1)]);
    assert_eq!(h.dev.test_location(0), Some(Location::Free));
    assert_eq!(h.flash.ec_of(0), Some(1));
}

/// Scrubbing a free PEB needs no move at all, just an erase.
#[test]
fn test_scrub_free_peb_erases_it() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));

    let free: Vec<(u32, u64)> = (0..4).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[], &free, 4), flash, vols, eba);
    h.dev.scrub_peb(3).unwrap();
    h.wait_idle();

    assert_eq!(h.dev.test_location(3), Some(Location::Free));
    assert_eq!(h.flash.ec_of(3), Some(11));
    assert!(h.eba.copies().is_empty());
}

/// A read error on the move source quarantines it in the erroneous set;
/// the target is erased and returned to the free pool.
#[test]
fn test_source_read_error_quarantines() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }
    eba.script_copy_result(Err(LebCopyError::SourceRdErr));

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.dev.scrub_peb(0).unwrap();
    h.wait_idle();

    assert_eq!(h.dev.test_location(0), Some(Location::Erroneous));
    assert_eq!(h.dev.erroneous_count(), 1);
    assert!(h.eba.copies().is_empty());
    assert_eq!(h.dev.free_count(), 8);
    // Exactly one free PEB was consumed as the target and then re-erased.
    let bumped = (1..=8).filter(|&p| h.flash.ec_of(p) == Some(11)).count();
    assert_eq!(bumped, 1);
    assert!(!h.dev.is_read_only());
}

/// Trouble on the move target tortures the target and keeps the source in
/// its set; the next attempt succeeds.
#[test]
fn test_target_write_error_retries_move() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }
    eba.script_copy_result(Err(LebCopyError::TargetWrErr));

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.dev.scrub_peb(0).unwrap();
    h.wait_idle();

    let target = vol.mapping(0).unwrap();
    assert_eq!(h.eba.copies(), vec![(0, target, 1)]);
    assert_eq!(h.dev.test_location(0), Some(Location::Free));
    assert_eq!(h.dev.test_location(target), Some(Location::Used));
    assert!(!h.dev.is_read_only());
}

/// Putting the move target mid-copy makes the worker erase it instead of
/// filing it into the used set.
#[test]
fn test_put_of_move_target_schedules_erase() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    let weak = Arc::downgrade(&h.dev);
    h.eba.set_copy_hook(move |_src, dst| {
        if let Some(dev) = weak.upgrade() {
            dev.put_peb(dst, false).unwrap();
        }
    });

    h.dev.scrub_peb(0).unwrap();
    h.wait_idle();

    let target = vol.mapping(0).unwrap();
    // The target was erased, not kept in used.
    assert_eq!(h.dev.test_location(target), Some(Location::Free));
    assert_eq!(h.flash.ec_of(target), Some(11));
    assert_eq!(h.dev.test_location(0), Some(Location::Free));
}

/// put_peb ends with the PEB erased, back in the free pool, with a strictly
/// larger erase counter.
#[test]
fn test_put_peb_erases() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 5, 0);
    flash.format_peb(1, 5);

    let h = Harness::new(cfg, attach_info(&[(0, 5)], &[(1, 5)], 2), flash, vols, eba);
    h.dev.put_peb(0, false).unwrap();
    h.wait_idle();

    assert_eq!(h.dev.test_location(0), Some(Location::Free));
    assert_eq!(h.flash.ec_of(0), Some(6));
    let data = h.flash.content(0, LEB_START, 64);
    assert!(data.iter().all(|&b| b == 0xFF));
}

/// Putting a PEB the engine does not know is an invariant violation and
/// latches read-only mode.
#[test]
fn test_put_unknown_peb_goes_read_only() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    flash.format_peb(0, 1);

    let h = Harness::new(cfg, attach_info(&[], &[(0, 1)], 1), flash, vols, eba);
    assert_eq!(h.dev.put_peb(5, false), Err(Error::NotFound));
    assert!(h.dev.is_read_only());
    assert_eq!(h.dev.put_peb(0, false), Err(Error::ReadOnly));
}

/// Handed-out PEBs are protected: a second get never returns the same PEB,
/// and protection expires after a full protection-queue cycle of erases.
#[test]
fn test_get_peb_protection_cycle() {
    let mut cfg = test_cfg(16);
    cfg.prot_queue_len = 2;
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 3, 0);
    stage_used(&flash, &vol, 1, 3, 1);
    let free: Vec<(u32, u64)> = (2..=9).map(|p| (p, 3)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(
        cfg,
        attach_info(&[(0, 3), (1, 3)], &free, 8),
        flash,
        vols,
        eba,
    );

    let p1 = {
        let claim = h.dev.get_peb(false, 0).unwrap();
        claim.pnum()
    };
    assert!(matches!(
        h.dev.test_location(p1),
        Some(Location::Protected(_))
    ));

    let p2 = {
        let claim = h.dev.get_peb(false, 0).unwrap();
        claim.pnum()
    };
    assert_ne!(p1, p2);

    // Two erase cycles age the queue enough to release p1 into used.
    h.dev.put_peb(0, false).unwrap();
    h.dev.put_peb(1, false).unwrap();
    h.wait_idle();
    assert_eq!(h.dev.test_location(p1), Some(Location::Used));
}

/// A claimed PEB can be put back while still under protection.
#[test]
fn test_put_protected_peb() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let free: Vec<(u32, u64)> = (0..4).map(|p| (p, 1)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[], &free, 4), flash, vols, eba);
    let p1 = {
        let claim = h.dev.get_peb(false, 0).unwrap();
        claim.pnum()
    };
    h.dev.put_peb(p1, false).unwrap();
    h.wait_idle();
    assert_eq!(h.dev.test_location(p1), Some(Location::Free));
    assert_eq!(h.flash.ec_of(p1), Some(2));
}

/// With no way to produce free PEBs, get_peb reports NoSpace instead of
/// hanging.
#[test]
fn test_get_peb_no_space() {
    let cfg = test_cfg(4);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    flash.format_peb(0, 1);

    let h = Harness::new(cfg, attach_info(&[], &[(0, 1)], 1), flash, vols, eba);
    assert!(matches!(h.dev.get_peb(false, 1), Err(Error::NoSpace)));
}

/// close() drains the queue: every pending work completes with the close
/// error and no PEB entries survive in the registry.
#[test]
fn test_shutdown_drains_pending_works() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    let used: Vec<(u32, u64)> = (0..5).map(|p| (p, 1)).collect();
    for &(p, ec) in &used {
        stage_used(&flash, &vol, p, ec, p);
    }
    flash.format_peb(5, 1);

    let h = Harness::new(cfg, attach_info(&used, &[(5, 1)], 6), flash, vols, eba);
    h.dev.engine.suspend();
    for p in 0..5 {
        h.dev.put_peb(p, false).unwrap();
    }
    assert_eq!(h.dev.test_pending_works(), 5);

    std::thread::scope(|s| {
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let dev = &h.dev;
                s.spawn(move || dev.flush_work())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        h.dev.close(Some(Error::ReadOnly));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(Error::ReadOnly));
        }
    });

    for p in 0..5 {
        assert_eq!(h.dev.peb_stats(Some(p)).unwrap(), vec![]);
    }
}

/// A hard erase failure marks the PEB bad and draws from the bad-block
/// reserve; the device keeps running.
#[test]
fn test_erase_failure_marks_bad() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 1, 0);
    flash.format_peb(1, 1);
    flash.inject_erase_error(0, IoError::Io);

    let mut attach = attach_info(&[(0, 1)], &[(1, 1)], 2);
    attach.beb_rsvd_pebs = 1;
    let h = Harness::new(cfg, attach, flash, vols, eba);

    h.dev.put_peb(0, false).unwrap();
    h.wait_idle();

    assert!(h.flash.is_bad(0));
    assert_eq!(h.dev.peb_stats(Some(0)).unwrap(), vec![]);
    assert!(!h.dev.is_read_only());
}

/// Transient erase failures re-schedule the erase; the PEB eventually makes
/// it back to the free pool.
#[test]
fn test_transient_erase_failure_retries() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 5, 0);
    flash.format_peb(1, 5);
    flash.inject_erase_error(0, IoError::Busy);

    let h = Harness::new(cfg, attach_info(&[(0, 5)], &[(1, 5)], 2), flash, vols, eba);
    h.dev.put_peb(0, false).unwrap();
    h.wait_idle();

    assert_eq!(h.dev.test_location(0), Some(Location::Free));
    assert_eq!(h.flash.ec_of(0), Some(6));
    assert!(!h.dev.is_read_only());
    assert!(!h.flash.is_bad(0));
}

/// Erase-counter overflow is refused and latches read-only mode.
#[test]
fn test_ec_overflow_goes_read_only() {
    let mut cfg = test_cfg(8);
    cfg.max_erase_counter = 10;
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 10, 0);
    flash.format_peb(1, 1);

    let h = Harness::new(cfg, attach_info(&[(0, 10)], &[(1, 1)], 2), flash, vols, eba);
    h.dev.put_peb(0, false).unwrap();
    h.wait_idle();

    assert!(h.dev.is_read_only());
    assert_eq!(h.dev.peb_stats(Some(0)).unwrap(), vec![]);
}

/// ensure_wl is idempotent while a wear-leveling work is pending.
#[test]
fn test_ensure_wl_idempotent() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(cfg, attach_info(&[(0, 0)], &free, 8), flash, vols, eba);
    h.dev.engine.suspend();
    h.dev.scrub_peb(0).unwrap();
    assert_eq!(h.dev.test_pending_works(), 1);
    h.dev.ensure_wl().unwrap();
    h.dev.ensure_wl().unwrap();
    assert_eq!(h.dev.test_pending_works(), 1);
    h.dev.engine.resume();
    h.wait_idle();
}

/// bitflip_check: clean PEBs stay put, flipped PEBs get scrubbed, flipped
/// free PEBs just get erased.
#[test]
fn test_bitflip_check_paths() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    stage_used(&flash, &vol, 1, 0, 1);
    let free: Vec<(u32, u64)> = (2..=9).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let h = Harness::new(
        cfg,
        attach_info(&[(0, 0), (1, 0)], &free, 8),
        flash,
        vols,
        eba,
    );

    // Clean PEB: no action.
    assert_eq!(
        h.dev.bitflip_check(0, false).unwrap(),
        BitflipStatus::Clean
    );
    assert_eq!(h.dev.test_location(0), Some(Location::Used));

    // Flipped used PEB: scrubbed (data relocated, old PEB erased).
    h.flash.inject_read_flips(1);
    assert_eq!(
        h.dev.bitflip_check(1, false).unwrap(),
        BitflipStatus::Scrubbing
    );
    h.wait_idle();
    assert_eq!(h.dev.test_location(1), Some(Location::Free));
    assert_ne!(vol.mapping(1), Some(1));

    // Flipped free PEB: erased in place.
    h.flash.inject_read_flips(9);
    assert_eq!(
        h.dev.bitflip_check(9, false).unwrap(),
        BitflipStatus::Scrubbing
    );
    h.wait_idle();
    assert_eq!(h.dev.test_location(9), Some(Location::Free));
    assert_eq!(h.flash.ec_of(9), Some(11));

    assert!(matches!(
        h.dev.bitflip_check(99, false),
        Err(Error::OutOfRange)
    ));
}

/// A PEB pinned by the attach index cannot be scrubbed; the engine asks for
/// an index rewrite instead.
#[test]
fn test_bitflip_check_fastmap_owned() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let fm = StubFastmap::new(0);

    flash.format_peb(0, 1);
    flash.format_peb(6, 1);
    let mut attach = attach_info(&[], &[(0, 1)], 2);
    attach.fastmap.push(PebScan { pnum: 6, ec: 1 });

    let h = Harness::with_fastmap(
        cfg,
        attach,
        flash,
        vols,
        eba,
        Some(Arc::clone(&fm)),
    );
    assert_eq!(h.dev.bitflip_check(6, true), Err(Error::Again));
    assert_eq!(fm.updates(), 1);
}

/// scrub_peb is a no-op for PEBs already being handled.
#[test]
fn test_scrub_peb_noop_paths() {
    let cfg = test_cfg(16);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 0, 0);
    stage_used(&flash, &vol, 1, 0, 1);
    let free: Vec<(u32, u64)> = (2..=9).map(|p| (p, 10)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }
    eba.script_copy_result(Err(LebCopyError::SourceRdErr));

    let h = Harness::new(
        cfg,
        attach_info(&[(0, 0), (1, 0)], &free, 8),
        flash,
        vols,
        eba,
    );

    // Quarantine PEB 0 via a failed move.
    h.dev.scrub_peb(0).unwrap();
    h.wait_idle();
    assert_eq!(h.dev.test_location(0), Some(Location::Erroneous));

    // Scrubbing an erroneous PEB is accepted and does nothing.
    h.dev.scrub_peb(0).unwrap();
    assert_eq!(h.dev.test_location(0), Some(Location::Erroneous));

    // Scrubbing a PEB already queued for erase is accepted and does
    // nothing.
    h.dev.engine.suspend();
    h.dev.put_peb(1, false).unwrap();
    h.dev.scrub_peb(1).unwrap();
    assert_eq!(h.dev.test_location(1), Some(Location::ErasePending));
    h.dev.engine.resume();
    h.wait_idle();
}

/// The attach-time erase list is erased in the background right after
/// init.
#[test]
fn test_attach_erase_list() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    flash.format_peb(0, 1);
    // PEB 5 is dirty from an interrupted write and carries no headers.
    let mut attach = attach_info(&[], &[(0, 1)], 2);
    attach.erase.push(PebScan { pnum: 5, ec: 7 });

    let h = Harness::new(cfg, attach, flash, vols, eba);
    h.wait_idle();

    assert_eq!(h.dev.test_location(5), Some(Location::Free));
    assert_eq!(h.flash.ec_of(5), Some(8));
}

/// A consolidated source moves through copy_lebs and carries its LEB slots
/// over to the move target.
#[test]
fn test_move_of_consolidated_peb() {
    let mut cfg = test_cfg(16);
    cfg.lebs_per_cpeb = 2;
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    flash.format_peb(0, 0);
    let vids = [
        Vid {
            vol_id: 0,
            lnum: 0,
            ..Default::default()
        },
        Vid {
            vol_id: 0,
            lnum: 1,
            ..Default::default()
        },
    ];
    flash.program_vid(0, &vids);
    vol.map_leb(0, 0);
    vol.map_leb(1, 0);

    let free: Vec<(u32, u64)> = (1..=8).map(|p| (p, 5000)).collect();
    for &(p, ec) in &free {
        flash.format_peb(p, ec);
    }

    let mut attach = attach_info(&[], &free, 8);
    attach.max_ec = 5000;
    attach.used.push(UsedPebScan {
        pnum: 0,
        ec: 0,
        scrub: false,
        consolidated: true,
    });
    for (pos, lnum) in [0u32, 1].iter().enumerate() {
        attach.lebs.push(LebScan {
            vol_id: 0,
            lnum: *lnum,
            pnum: 0,
            peb_pos: pos,
        });
    }

    let h = Harness::new(cfg, attach, flash, vols, eba);
    h.wait_idle();

    let target = vol.mapping(0).unwrap();
    assert_ne!(target, 0);
    assert_eq!(vol.mapping(1), Some(target));
    assert_eq!(h.eba.copies(), vec![(0, target, 2)]);
    // The packed-LEB bookkeeping followed the data.
    assert!(h.dev.consolidated(0).is_none());
    let slots = h.dev.consolidated(target).unwrap();
    assert_eq!(slots.iter().flatten().count(), 2);
    assert_eq!(h.dev.test_location(0), Some(Location::Free));
}

/// Registry statistics cover every known PEB.
#[test]
fn test_peb_stats() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 4, 0);
    flash.format_peb(1, 9);
    flash.format_peb(2, 2);

    let h = Harness::new(
        cfg,
        attach_info(&[(0, 4)], &[(1, 9), (2, 2)], 3),
        flash,
        vols,
        eba,
    );

    let all = h.dev.peb_stats(None).unwrap();
    assert_eq!(all.len(), 3);
    let one = h.dev.peb_stats(Some(1)).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].ec, 9);
    assert_eq!(h.dev.max_ec(), 9);
    assert!(h.dev.peb_stats(Some(99)).is_err());
}

/// Read counters accumulate on reads and reset on erase.
#[cfg(feature = "read-counter")]
#[test]
fn test_read_counter() {
    let cfg = test_cfg(8);
    let flash = SimFlash::new(&cfg);
    let vols = StubVolumes::new();
    let eba = StubEba::new(Arc::clone(&vols));
    let vol = StubVolume::new(0, VolType::Dynamic);
    vols.add(Arc::clone(&vol));

    stage_used(&flash, &vol, 0, 1, 0);
    flash.format_peb(1, 1);

    let h = Harness::new(cfg, attach_info(&[(0, 1)], &[(1, 1)], 2), flash, vols, eba);
    h.dev.note_read(0);
    h.dev.note_read(0);
    assert_eq!(h.dev.peb_stats(Some(0)).unwrap()[0].rc, Some(2));

    h.dev.put_peb(0, false).unwrap();
    h.wait_idle();
    assert_eq!(h.dev.peb_stats(Some(0)).unwrap()[0].rc, Some(0));
}
