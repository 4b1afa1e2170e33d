// ============================================
// Background Jobs
// ============================================
//
// page_refresh: recomposes the landing page on a fixed interval and caches the
// snapshot in Redis for readers that only need the latest page.

pub mod page_refresh;

pub use page_refresh::{
    run_refresh_cycle, start_page_refresh, PageCache, PageRefreshConfig, RedisPageCache,
};
