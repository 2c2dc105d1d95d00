use std::{
    future::{self, Future},
    pin::{pin, Pin},
    task::Poll,
};

/// Waits for the first of two futures, alternating which one is polled first
/// so that a busy socket can't starve the other one.
pub struct RoundRobinSelector {
    a_first: bool,
}

impl RoundRobinSelector {
    pub fn new() -> RoundRobinSelector {
        RoundRobinSelector { a_first: true }
    }

    pub async fn select<T>(
        &mut self,
        a: impl Future<Output = T>,
        b: impl Future<Output = T>,
    ) -> T {
        let (mut a, mut b) = (pin!(a), pin!(b));
        let a_first = self.a_first;
        self.a_first = !self.a_first;
        future::poll_fn(move |cx| {
            let (first, second): (Pin<&mut dyn Future<Output = T>>, Pin<&mut dyn Future<Output = T>>) =
                if a_first {
                    (a.as_mut(), b.as_mut())
                } else {
                    (b.as_mut(), a.as_mut())
                };
            if let Poll::Ready(r) = first.poll(cx) {
                Poll::Ready(r)
            } else if let Poll::Ready(r) = second.poll(cx) {
                Poll::Ready(r)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alternates_between_ready_futures() {
        let mut selector = RoundRobinSelector::new();
        let mut results = vec![];
        for _ in 0..4 {
            results.push(selector.select(async { 'a' }, async { 'b' }).await);
        }
        assert_eq!(results, vec!['a', 'b', 'a', 'b']);
    }

    #[tokio::test]
    async fn pending_future_is_skipped() {
        let mut selector = RoundRobinSelector::new();
        for _ in 0..2 {
            let result = selector
                .select(future::pending::<u32>(), async { 7 })
                .await;
            assert_eq!(result, 7);
        }
    }
}
