//! Behaviour every [`Log`] implementation must share.

use error_stack::Report;

use super::Log;
use crate::error::LogError;
use crate::{Promise, Proposal};

fn collect<L: Log>(log: &L, start: u64, stop: u64) -> Vec<Proposal> {
    let mut out = Vec::new();
    log.range(start, stop, |p: Proposal| {
        out.push(p);
        Ok(())
    })
    .unwrap();
    out
}

pub(crate) fn empty_log_has_no_last<L: Log>(log: &L) {
    assert_eq!(log.last::<Proposal>().unwrap(), None);
    assert!(collect(log, 0, u64::MAX).is_empty());
}

pub(crate) fn last_returns_greatest_id<L: Log>(log: &L) {
    log.record(5, &Proposal::new(5, "five")).unwrap();
    log.record(9, &Proposal::new(9, "nine")).unwrap();
    log.record(7, &Proposal::new(7, "seven")).unwrap();

    assert_eq!(log.last::<Proposal>().unwrap(), Some(Proposal::new(9, "nine")));
}

pub(crate) fn record_is_idempotent<L: Log>(log: &L) {
    log.record(3, &Proposal::new(3, "first")).unwrap();
    log.record(3, &Proposal::new(3, "second")).unwrap();

    assert_eq!(collect(log, 0, u64::MAX), vec![Proposal::new(3, "first")]);
}

pub(crate) fn range_is_inclusive_and_ordered<L: Log>(log: &L) {
    for id in [40, 10, 30, 20, 50] {
        log.record(id, &Proposal::new(id, id.to_string())).unwrap();
    }

    let ids: Vec<u64> = collect(log, 20, 40).iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![20, 30, 40]);

    let ids: Vec<u64> = collect(log, 0, u64::MAX).iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![10, 20, 30, 40, 50]);

    assert!(collect(log, 41, 49).is_empty());
    assert!(collect(log, 50, 10).is_empty());
}

pub(crate) fn range_stops_at_callback_error<L: Log>(log: &L) {
    for id in 1..=5 {
        log.record(id, &Proposal::new(id, "v")).unwrap();
    }

    let mut seen = Vec::new();
    let res = log.range(0, u64::MAX, |p: Proposal| {
        if p.id == 3 {
            return Err(Report::new(LogError).attach("stop"));
        }
        seen.push(p.id);
        Ok(())
    });

    assert!(res.is_err());
    assert_eq!(seen, vec![1, 2]);
}

pub(crate) fn prefixes_are_isolated<L: Log>(log: &L) {
    let promised = log.with_prefix("promised/");
    let accepted = log.with_prefix("accepted/");

    promised.record(10, &Promise::new(10)).unwrap();
    accepted.record(4, &Proposal::new(4, "a")).unwrap();

    assert_eq!(promised.last::<Promise>().unwrap(), Some(Promise::new(10)));
    assert_eq!(accepted.last::<Proposal>().unwrap(), Some(Proposal::new(4, "a")));
    assert_eq!(log.last::<Proposal>().unwrap(), None);

    let nested = promised.with_prefix("inner/");
    assert_eq!(nested.last::<Promise>().unwrap(), None);
    nested.record(1, &Promise::new(1)).unwrap();
    assert_eq!(promised.last::<Promise>().unwrap(), Some(Promise::new(10)));
}

pub(crate) fn views_share_storage<L: Log>(log: &L) {
    let a = log.with_prefix("shared/");
    let b = log.with_prefix("shared/");

    a.record(8, &Proposal::new(8, "x")).unwrap();
    assert_eq!(b.last::<Proposal>().unwrap(), Some(Proposal::new(8, "x")));
}
