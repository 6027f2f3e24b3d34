//! The persist/evict pipeline.
//!
//! `persist` marshals a page's chain into log blocks, swings the head to
//! a flush delta and publishes it with the usual CAS. A lost CAS costs
//! nothing durable: the already-reserved blocks are overwritten with the
//! discard type, finalized so the commit pipeline keeps moving, and the
//! whole step retries from a fresh read.

use crate::error::Result;
use crate::lss::{LssOffset, Reservation, BLOCK_TYPE_SIZE};
use crate::page::codec::{self, MarshalPlan};
use crate::page::Page;
use crate::pagetable::PageId;
use crate::store::Store;
use crate::writer::FlushCtx;

impl Store {
    /// Reserves and writes the plan's blocks oldest-first, linking each
    /// newer block to the previous offset. Returns the reservations
    /// (finalize on CAS success, discard on failure) and the newest
    /// block's offset.
    fn write_plan<'a>(
        &'a self,
        plan: &MarshalPlan,
        ctx: &mut FlushCtx,
    ) -> Result<(Vec<Reservation<'a>>, LssOffset)> {
        let mut reservations = Vec::with_capacity(plan.blocks.len());
        let mut prev: Option<LssOffset> = None;
        for blk in &plan.blocks {
            let payload = ctx.buf.request(blk.rendered_size());
            blk.render_into(prev, payload);
            let mut res = self.lss.reserve(BLOCK_TYPE_SIZE + payload.len())?;
            res.write_block(blk.block_type(), payload);
            prev = Some(res.offset());
            reservations.push(res);
        }
        // marshal always produces at least one block
        let offset = prev.unwrap_or_default();
        Ok((reservations, offset))
    }

    /// One marshal-write-publish attempt for a page the caller already
    /// mutated (rollback uses this). Returns whether the CAS went
    /// through; on failure the blocks are discarded.
    pub(crate) fn flush_page(&self, pg: &mut Page, ctx: &mut FlushCtx) -> Result<bool> {
        let plan = codec::marshal(pg, self.config.max_page_lss_segments)?;
        let (reservations, offset) = self.write_plan(&plan, ctx)?;
        pg.add_flush_record(offset, plan.data_size, plan.num_segments);
        if self.table.update_mapping(pg) {
            for res in reservations {
                res.finalize()?;
            }
            self.account_flush(&plan);
            Ok(true)
        } else {
            for mut res in reservations {
                res.discard();
                res.finalize()?;
            }
            Ok(false)
        }
    }

    fn account_flush(&self, plan: &MarshalPlan) {
        self.stats.flush_data_size.fetch_add(
            plan.data_size as i64 - plan.stale_size as i64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    /// Flushes the page if it carries unlogged state; with `evict`, also
    /// drops its memory down to a bare flush marker. Conflicting CAS
    /// publications are retried locally, never surfaced.
    pub(crate) fn persist(&self, pid: &PageId, evict: bool, ctx: &mut FlushCtx) -> Result<()> {
        loop {
            // never fetch from the log on the flush path
            let Some(mut pg) = self.read_page_nofetch(pid) else {
                return Ok(());
            };

            if pg.needs_flush() {
                let plan = codec::marshal(&pg, self.config.max_page_lss_segments)?;
                let (reservations, offset) = self.write_plan(&plan, ctx)?;
                let detached = pg.prev_head.clone();
                if evict {
                    pg.evict(offset, plan.data_size, plan.num_segments);
                } else {
                    pg.add_flush_record(offset, plan.data_size, plan.num_segments);
                }

                if self.table.update_mapping(&mut pg) {
                    for res in reservations {
                        res.finalize()?;
                    }
                    self.account_flush(&plan);
                    if pg.reclaim {
                        if let Some(old) = detached {
                            self.gc.stage(self.load_sn(), vec![old]);
                        }
                    }
                    return Ok(());
                }
                for mut res in reservations {
                    res.discard();
                    res.finalize()?;
                }
            } else if evict && pg.is_evictable() {
                // clean page: reuse the last flush instead of rewriting
                let Some((offset, data_size, num_segments)) = pg.flush_info() else {
                    return Ok(());
                };
                let detached = pg.prev_head.clone();
                pg.evict(offset, data_size, num_segments);
                if self.table.update_mapping(&mut pg) {
                    if let Some(old) = detached {
                        self.gc.stage(self.load_sn(), vec![old]);
                    }
                    return Ok(());
                }
            } else {
                return Ok(());
            }
        }
    }

    /// Flushes every page, fanned out over the persist worker pool, and
    /// makes the log durable to the OS.
    pub fn persist_all(&self) -> Result<()> {
        self.page_visitor(self.config.num_persistor_threads, |pid, shard| {
            let ctx = &self.persist_ctxs[shard % self.persist_ctxs.len()];
            let mut ctx = ctx.lock().unwrap();
            self.persist(pid, false, &mut ctx)
        })?;
        self.lss.sync(false)
    }

    /// Flushes and evicts every page; reads afterwards are served by
    /// reloading from the log.
    pub fn evict_all(&self) -> Result<()> {
        self.page_visitor(self.config.num_persistor_threads, |pid, shard| {
            let ctx = &self.evict_ctxs[shard % self.evict_ctxs.len()];
            let mut ctx = ctx.lock().unwrap();
            self.persist(pid, true, &mut ctx)
        })
    }

    /// Walks all pages in key order, partitioned across `nthreads`
    /// workers. The first worker error wins; the walk still completes.
    pub(crate) fn page_visitor<F>(&self, nthreads: usize, f: F) -> Result<()>
    where
        F: Fn(&PageId, usize) -> Result<()> + Sync,
    {
        let partitions = self.table.partitions(nthreads);
        let first_err: std::sync::Mutex<Result<()>> = std::sync::Mutex::new(Ok(()));

        std::thread::scope(|s| {
            for (shard, partition) in partitions.iter().enumerate() {
                let f = &f;
                let first_err = &first_err;
                s.spawn(move || {
                    for pid in partition {
                        if let Err(e) = f(pid, shard) {
                            tracing::error!(error = %e, shard, "page visitor worker failed");
                            let mut slot = first_err.lock().unwrap();
                            if slot.is_ok() {
                                *slot = Err(e);
                            }
                            return;
                        }
                    }
                });
            }
        });

        first_err.into_inner().unwrap()
    }
}
