use std::future::Future;

use futures::stream::BoxStream;

use crate::StoreError;

/// One batch fetched from a backend, plus the cursor for the next batch.
///
/// `next` is `None` once the backend has nothing further after this batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T, C = String> {
    pub items: Vec<T>,
    pub next: Option<C>,
}

impl<T, C> Page<T, C> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }

    /// Builds a page from a batch fetched with `requested` as its size: a short
    /// batch ends the sequence, a full one continues after its last item.
    pub fn from_batch(items: Vec<T>, requested: usize, cursor: impl Fn(&T) -> C) -> Self {
        let next = if items.len() < requested {
            None
        } else {
            items.last().map(cursor)
        };
        Self { items, next }
    }
}

/// Window applied on top of the raw backend order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Lazily walks `fetch` page by page, keeping the items accepted by `keep`
/// and applying `window` to the kept items.
///
/// Nothing is fetched until the stream is polled, and no state survives the
/// stream: calling the producer again restarts from `start`.
pub fn paginate<'a, T, C, K, F, Fut>(
    start: Option<C>,
    page_size: usize,
    window: Window,
    keep: K,
    mut fetch: F,
) -> BoxStream<'a, Result<T, StoreError>>
where
    T: Send + 'a,
    C: Send + 'a,
    K: Fn(&T) -> bool + Send + 'a,
    F: FnMut(Option<C>, usize) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T, C>, StoreError>> + Send + 'a,
{
    let page_size = page_size.max(1);
    Box::pin(async_stream::try_stream! {
        let mut cursor = start;
        let mut skip = window.offset;
        let mut remaining = window.limit;
        let mut done = remaining == Some(0);

        while !done {
            let page = fetch(cursor.take(), page_size).await?;
            for item in page.items {
                if remaining == Some(0) {
                    break;
                }
                if !keep(&item) {
                    continue;
                }
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                }
                yield item;
            }
            done = page.next.is_none() || remaining == Some(0);
            cursor = page.next;
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn numbers(
        total: u32,
    ) -> impl FnMut(Option<u32>, usize) -> std::future::Ready<Result<Page<u32, u32>, StoreError>>
    {
        move |after, size| {
            let first = after.map_or(0, |after| after + 1);
            let items: Vec<u32> = (first..total).take(size).collect();
            std::future::ready(Ok(Page::from_batch(items, size, |item| *item)))
        }
    }

    #[tokio::test]
    async fn walks_every_page() {
        let all: Vec<u32> = paginate(None, 3, Window::default(), |_| true, numbers(10))
            .try_collect()
            .await
            .expect("pages should stream");

        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn window_applies_after_the_filter() {
        let window = Window {
            offset: 1,
            limit: Some(2),
        };
        let even: Vec<u32> = paginate(None, 4, window, |item| item % 2 == 0, numbers(20))
            .try_collect()
            .await
            .expect("pages should stream");

        assert_eq!(even, vec![2, 4]);
    }

    #[tokio::test]
    async fn errors_end_the_stream() {
        let failing = |_: Option<u32>, _: usize| {
            std::future::ready(Err::<Page<u32, u32>, _>(StoreError::transient("down")))
        };
        let result: Result<Vec<u32>, _> = paginate(None, 4, Window::default(), |_| true, failing)
            .try_collect()
            .await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
    }
}
