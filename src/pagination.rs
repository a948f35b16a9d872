//! Cursor-chained pagination.
//!
//! List endpoints return one page plus an opaque continuation cursor. A [`PageWalker`] holds
//! the arguments of one call and its response, and derives the arguments of the neighbouring
//! calls through user-supplied functions:
//! - `next(params, last_response)` returns the arguments of the following page, or `None`
//!   when the response carried no continuation cursor. This is the only exhaustion signal.
//! - `previous(params, last_response)` (optional) does the same backwards.
//!
//! Stepping never mutates a walker: every fetch returns a new walker, and the old one keeps
//! answering for its own page.
//!
//! Example
//! ```rust
//! use cloudpace::PageWalker;
//!
//! #[derive(Clone, Debug)]
//! struct Listing { items: Vec<u32>, cursor: Option<String> }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let walker = PageWalker::builder(
//!     None::<String>,
//!     |cursor: Option<String>| async move {
//!         Ok::<_, std::io::Error>(match cursor.as_deref() {
//!             None => Listing { items: vec![1, 2], cursor: Some("c1".into()) },
//!             _ => Listing { items: vec![3], cursor: None },
//!         })
//!     },
//!     |_params, last: Option<&Listing>| last.and_then(|l| l.cursor.clone()).map(Some),
//! )
//! .transform(|l: &Listing| l.items.clone())
//! .build();
//!
//! let first = walker.get_current_page().await.unwrap();
//! assert_eq!(first.data(), Some(vec![1, 2]));
//! let second = first.get_next_page().await.unwrap();
//! assert_eq!(second.data(), Some(vec![3]));
//! assert!(!second.has_next_page());
//! # });
//! ```

use crate::error::PaginationError;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Fetches one page for a set of call arguments.
///
/// Implemented for any `Fn(P) -> impl Future<Output = Result<Page, Error>>`, so closures over
/// an API client work directly.
#[async_trait]
pub trait PageFetcher<P>: Send + Sync {
    type Page;
    type Error;

    async fn fetch(&self, params: P) -> Result<Self::Page, Self::Error>;
}

#[async_trait]
impl<P, F, Fut, D, E> PageFetcher<P> for F
where
    P: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<D, E>> + Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
    type Page = D;
    type Error = E;

    async fn fetch(&self, params: P) -> Result<D, E> {
        (self)(params).await
    }
}

type ParamsFn<P, D> = Arc<dyn Fn(&P, Option<&D>) -> Option<P> + Send + Sync>;
type TransformFn<D, O> = Arc<dyn Fn(&D) -> O + Send + Sync>;
type SharedFetcher<P, D, E> = Arc<dyn PageFetcher<P, Page = D, Error = E>>;

/// One position in a paginated listing.
///
/// `P` are the call arguments, `D` the raw page, `E` the fetch error and `O` what
/// [`PageWalker::data`] hands out after the transform.
pub struct PageWalker<P, D, E, O = D> {
    parameters: P,
    last_response: Option<Arc<D>>,
    page_number: usize,
    fetcher: SharedFetcher<P, D, E>,
    next: ParamsFn<P, D>,
    previous: Option<ParamsFn<P, D>>,
    transform: TransformFn<D, O>,
}

impl<P: Clone, D, E, O> Clone for PageWalker<P, D, E, O> {
    fn clone(&self) -> Self {
        Self {
            parameters: self.parameters.clone(),
            last_response: self.last_response.clone(),
            page_number: self.page_number,
            fetcher: self.fetcher.clone(),
            next: self.next.clone(),
            previous: self.previous.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<P: fmt::Debug, D, E, O> fmt::Debug for PageWalker<P, D, E, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageWalker")
            .field("parameters", &self.parameters)
            .field("page_number", &self.page_number)
            .field("fetched", &self.last_response.is_some())
            .field("previous", &self.previous.is_some())
            .finish()
    }
}

impl<P, D, E> PageWalker<P, D, E, D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Start building a walker positioned on page 0 with `parameters`.
    pub fn builder<F, N>(parameters: P, fetcher: F, next: N) -> PageWalkerBuilder<P, D, E, D>
    where
        F: PageFetcher<P, Page = D, Error = E> + 'static,
        N: Fn(&P, Option<&D>) -> Option<P> + Send + Sync + 'static,
    {
        PageWalkerBuilder {
            parameters,
            data: None,
            fetcher: Arc::new(fetcher),
            next: Arc::new(next),
            previous: None,
            transform: Arc::new(D::clone),
        }
    }
}

impl<P, D, E, O> PageWalker<P, D, E, O>
where
    P: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Zero-based page index.
    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn parameters(&self) -> &P {
        &self.parameters
    }

    /// Whether this walker holds a response.
    pub fn is_fetched(&self) -> bool {
        self.last_response.is_some()
    }

    /// The untransformed response, if fetched.
    pub fn raw_data(&self) -> Option<&D> {
        self.last_response.as_deref()
    }

    /// The response passed through the transform, if fetched.
    pub fn data(&self) -> Option<O> {
        self.last_response.as_deref().map(|d| (self.transform)(d))
    }

    pub fn has_next_page(&self) -> bool {
        (self.next)(&self.parameters, self.raw_data()).is_some()
    }

    pub fn has_previous_page(&self) -> bool {
        self.previous
            .as_ref()
            .map_or(false, |previous| previous(&self.parameters, self.raw_data()).is_some())
    }

    /// Fetch the page for the current parameters.
    pub async fn get_current_page(&self) -> Result<Self, PaginationError<E>> {
        self.step(self.parameters.clone(), self.page_number).await
    }

    /// Fetch the following page.
    ///
    /// Fails with [`PaginationError::Exhausted`] when the last response carried no cursor.
    /// On an unfetched walker the answer depends on what `next` makes of a missing response;
    /// call [`PageWalker::get_current_page`] first.
    pub async fn get_next_page(&self) -> Result<Self, PaginationError<E>> {
        let Some(parameters) = (self.next)(&self.parameters, self.raw_data()) else {
            return Err(PaginationError::Exhausted { page_number: self.page_number });
        };
        self.step(parameters, self.page_number + 1).await
    }

    /// Fetch the preceding page.
    ///
    /// Besides requiring a `previous` function, this refuses to move when there is no *next*
    /// page, so the last page of a listing cannot step backwards.
    // TODO: decide whether this guard should consult `has_previous_page` instead; both
    // behaviors are pinned in tests/pagination.rs.
    pub async fn get_previous_page(&self) -> Result<Self, PaginationError<E>> {
        let Some(previous) = &self.previous else {
            return Err(PaginationError::NoPreviousPage);
        };
        if !self.has_next_page() {
            return Err(PaginationError::Exhausted { page_number: self.page_number });
        }
        let Some(parameters) = previous(&self.parameters, self.raw_data()) else {
            return Err(PaginationError::Exhausted { page_number: self.page_number });
        };
        self.step(parameters, self.page_number.saturating_sub(1)).await
    }

    async fn step(&self, parameters: P, page_number: usize) -> Result<Self, PaginationError<E>> {
        let page = self.fetcher.fetch(parameters.clone()).await.map_err(PaginationError::Fetch)?;
        tracing::debug!(page_number, "page fetched");
        Ok(Self {
            parameters,
            last_response: Some(Arc::new(page)),
            page_number,
            fetcher: self.fetcher.clone(),
            next: self.next.clone(),
            previous: self.previous.clone(),
            transform: self.transform.clone(),
        })
    }

    /// Lazily walk forward from this page, yielding each page's transformed data.
    ///
    /// The current page is fetched first if it has not been. The stream ends after the first
    /// page without a continuation cursor, or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<O, PaginationError<E>>> {
        stream::unfold(Some((self, true)), |state| async move {
            let (walker, first) = state?;
            let walker = if first && walker.is_fetched() {
                walker
            } else if first {
                match walker.get_current_page().await {
                    Ok(w) => w,
                    Err(e) => return Some((Err(e), None)),
                }
            } else {
                if !walker.has_next_page() {
                    return None;
                }
                match walker.get_next_page().await {
                    Ok(w) => w,
                    Err(e) => return Some((Err(e), None)),
                }
            };
            let item = walker.data()?;
            Some((Ok(item), Some((walker, false))))
        })
    }
}

/// Builder for [`PageWalker`].
pub struct PageWalkerBuilder<P, D, E, O> {
    parameters: P,
    data: Option<D>,
    fetcher: SharedFetcher<P, D, E>,
    next: ParamsFn<P, D>,
    previous: Option<ParamsFn<P, D>>,
    transform: TransformFn<D, O>,
}

impl<P, D, E, O> PageWalkerBuilder<P, D, E, O> {
    /// Enable backwards stepping.
    pub fn previous<F>(mut self, previous: F) -> Self
    where
        F: Fn(&P, Option<&D>) -> Option<P> + Send + Sync + 'static,
    {
        self.previous = Some(Arc::new(previous));
        self
    }

    /// Map raw pages to what [`PageWalker::data`] returns.
    pub fn transform<O2, F>(self, transform: F) -> PageWalkerBuilder<P, D, E, O2>
    where
        F: Fn(&D) -> O2 + Send + Sync + 'static,
    {
        PageWalkerBuilder {
            parameters: self.parameters,
            data: self.data,
            fetcher: self.fetcher,
            next: self.next,
            previous: self.previous,
            transform: Arc::new(transform),
        }
    }

    /// Seed the walker with an already fetched response for its parameters.
    pub fn with_data(mut self, data: D) -> Self {
        self.data = Some(data);
        self
    }

    pub fn build(self) -> PageWalker<P, D, E, O> {
        PageWalker {
            parameters: self.parameters,
            last_response: self.data.map(Arc::new),
            page_number: 0,
            fetcher: self.fetcher,
            next: self.next,
            previous: self.previous,
            transform: self.transform,
        }
    }
}
