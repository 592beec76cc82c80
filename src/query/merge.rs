//! Merge-join over per-predicate sorted record-id streams.
//!
//! Every sub-stream yields ascending record ids. At each step the smallest
//! current id across all sub-streams is the candidate; the combinator sees a
//! matrix (key type x predicate) of which sub-streams hold the candidate, and
//! those sub-streams advance. Each id is reported at most once.

use std::sync::Arc;

use itertools::Itertools;

use super::chain::{ChainSource, DeadRecords};
use super::settings::QuerySettings;
use crate::error::Result;
use crate::psf::RecordId;
use crate::Error;

/// Decides whether a candidate matches, given the indicator matrix.
pub type Combinator = Arc<dyn Fn(&[Vec<bool>]) -> bool + Send + Sync>;

struct SubStream {
    source: ChainSource,
    ids: std::vec::IntoIter<RecordId>,
    current: Option<RecordId>,
}

impl SubStream {
    fn new(source: ChainSource) -> Self {
        Self {
            source,
            ids: Vec::new().into_iter(),
            current: None,
        }
    }

    /// Installs the chain results of every queried key.
    fn start(&mut self, per_key: Vec<Vec<RecordId>>, start_after: Option<RecordId>) {
        let ids: Vec<RecordId> = per_key
            .into_iter()
            .kmerge()
            .dedup()
            .filter(|id| start_after.map_or(true, |after| *id > after))
            .collect();
        self.ids = ids.into_iter();
        self.current = self.ids.next();
    }

    fn advance(&mut self) {
        self.current = self.ids.next();
    }
}

pub(crate) struct MergeJoin {
    streams: Vec<Vec<SubStream>>,
    combinator: Combinator,
    settings: QuerySettings,
    dead: DeadRecords,
    loaded: bool,
    done: bool,
}

impl MergeJoin {
    pub(crate) fn new(
        sources: Vec<Vec<ChainSource>>,
        combinator: Combinator,
        settings: QuerySettings,
    ) -> Self {
        let streams = sources
            .into_iter()
            .map(|group| group.into_iter().map(SubStream::new).collect())
            .collect();
        Self {
            streams,
            combinator,
            settings,
            dead: DeadRecords::new(),
            loaded: false,
            done: false,
        }
    }

    /// Walks every chain, blocking on pending reads. Returns `false` if
    /// the query was cancelled meanwhile.
    fn load_blocking(&mut self) -> Result<bool> {
        for group in self.streams.iter_mut() {
            for stream in group.iter_mut() {
                let source = &stream.source;
                let mut per_key = Vec::with_capacity(source.keys.len());
                for key in &source.keys {
                    match source.reader.read_chain(
                        source.ordinal,
                        key,
                        &self.settings.cancel,
                        &mut self.dead,
                    )? {
                        Some(ids) => per_key.push(ids),
                        None => return Ok(false),
                    }
                }
                stream.start(per_key, self.settings.start_after);
            }
        }
        Ok(true)
    }

    async fn load_async(&mut self) -> Result<bool> {
        for group in self.streams.iter_mut() {
            for stream in group.iter_mut() {
                let source = &stream.source;
                let mut per_key = Vec::with_capacity(source.keys.len());
                for key in &source.keys {
                    let ids = source
                        .reader
                        .read_chain_async(source.ordinal, key, &self.settings.cancel, &mut self.dead)
                        .await?;
                    match ids {
                        Some(ids) => per_key.push(ids),
                        None => return Ok(false),
                    }
                }
                stream.start(per_key, self.settings.start_after);
            }
        }
        Ok(true)
    }

    fn after_load(&mut self, loaded: Result<bool>) -> Result<()> {
        match loaded {
            Ok(true) => {
                self.loaded = true;
                let empty_stop = self.streams.iter().enumerate().any(|(kt, group)| {
                    group.iter().enumerate().any(|(p, stream)| {
                        stream.current.is_none() && self.settings.should_stop_on_eos(kt, p)
                    })
                });
                if empty_stop {
                    self.done = true;
                }
                Ok(())
            }
            Ok(false) => {
                self.done = true;
                Ok(())
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    pub(crate) fn next_blocking(&mut self) -> Result<Option<RecordId>> {
        if !self.loaded && !self.done {
            let loaded = self.load_blocking();
            self.after_load(loaded)?;
        }
        Ok(self.step())
    }

    pub(crate) async fn next_async(&mut self) -> Result<Option<RecordId>> {
        if !self.loaded && !self.done {
            let loaded = self.load_async().await;
            self.after_load(loaded)?;
        }
        Ok(self.step())
    }

    fn step(&mut self) -> Option<RecordId> {
        while !self.done {
            if self.settings.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            let Some(current) = self.streams.iter().flatten().filter_map(|s| s.current).min()
            else {
                self.done = true;
                return None;
            };

            let matrix: Vec<Vec<bool>> = self
                .streams
                .iter()
                .map(|group| group.iter().map(|s| s.current == Some(current)).collect())
                .collect();
            let matched = (self.combinator)(&matrix);

            for (kt, group) in self.streams.iter_mut().enumerate() {
                for (p, stream) in group.iter_mut().enumerate() {
                    if !matrix[kt][p] {
                        continue;
                    }
                    stream.advance();
                    if stream.current.is_none() && self.settings.should_stop_on_eos(kt, p) {
                        self.done = true;
                    }
                }
            }

            if matched {
                return Some(current);
            }
        }
        None
    }
}

/// A prepared query. Run it with [`Query::iter`] (blocking),
/// [`Query::into_stream`] (async), or page through it with
/// [`Query::segment`].
#[derive(Clone)]
pub struct Query {
    sources: Vec<Vec<ChainSource>>,
    combinator: Combinator,
    settings: QuerySettings,
}

impl Query {
    pub(crate) fn new(
        sources: Vec<Vec<ChainSource>>,
        combinator: Combinator,
        settings: QuerySettings,
    ) -> Self {
        Self {
            sources,
            combinator,
            settings,
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn iter(&self) -> QueryIterator {
        QueryIterator {
            join: self.join(None),
        }
    }

    pub fn into_stream(self) -> QueryStream {
        QueryStream {
            join: self.join(None),
        }
    }

    /// Up to `limit` results after `continuation`, plus the continuation of
    /// the next page if there is one.
    pub fn segment(&self, continuation: Option<RecordId>, limit: usize) -> Result<QuerySegment> {
        check_limit(limit)?;
        let mut join = self.join(continuation);
        let mut records = Vec::with_capacity(limit + 1);
        while records.len() <= limit {
            match join.next_blocking()? {
                Some(id) => records.push(id),
                None => break,
            }
        }
        Ok(QuerySegment::from_page(records, limit))
    }

    pub async fn segment_async(
        &self,
        continuation: Option<RecordId>,
        limit: usize,
    ) -> Result<QuerySegment> {
        check_limit(limit)?;
        let mut join = self.join(continuation);
        let mut records = Vec::with_capacity(limit + 1);
        while records.len() <= limit {
            match join.next_async().await? {
                Some(id) => records.push(id),
                None => break,
            }
        }
        Ok(QuerySegment::from_page(records, limit))
    }

    fn join(&self, continuation: Option<RecordId>) -> MergeJoin {
        let mut settings = self.settings.clone();
        if let Some(continuation) = continuation {
            settings.start_after = Some(
                settings
                    .start_after
                    .map_or(continuation, |after| after.max(continuation)),
            );
        }
        MergeJoin::new(self.sources.clone(), self.combinator.clone(), settings)
    }
}

impl IntoIterator for Query {
    type Item = Result<RecordId>;
    type IntoIter = QueryIterator;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("sources", &self.sources)
            .field("settings", &self.settings)
            .finish()
    }
}

fn check_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::InvalidArgument(
            "segment limit must be positive".to_string(),
        ));
    }
    Ok(())
}

/// One page of a segmented query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySegment {
    pub records: Vec<RecordId>,
    /// Pass to the next call to continue; `None` on the last page.
    pub continuation: Option<RecordId>,
}

impl QuerySegment {
    fn from_page(mut records: Vec<RecordId>, limit: usize) -> Self {
        let continuation = if records.len() > limit {
            records.truncate(limit);
            records.last().copied()
        } else {
            None
        };
        Self {
            records,
            continuation,
        }
    }
}

/// Blocking query results in ascending order. Fused after an error.
pub struct QueryIterator {
    join: MergeJoin,
}

impl Iterator for QueryIterator {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.join.next_blocking().transpose()
    }
}

/// Async query results in ascending order. Fused after an error.
///
/// The first `next` walks every chain of the query and sorts each one;
/// later calls only merge.
pub struct QueryStream {
    join: MergeJoin,
}

impl QueryStream {
    pub async fn next(&mut self) -> Option<Result<RecordId>> {
        self.join.next_async().await.transpose()
    }

    pub async fn try_collect(mut self) -> Result<Vec<RecordId>> {
        let mut records = Vec::new();
        while let Some(id) = self.next().await {
            records.push(id?);
        }
        Ok(records)
    }
}
