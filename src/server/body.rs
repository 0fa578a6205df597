//! Response body for image redemption.
//!
//! Streams the image in fixed-size frames and confirms the delivery once the
//! last frame has been handed to hyper. If hyper drops the body earlier
//! (client gone, write error), the delivery is dropped unconfirmed and the
//! entry goes back into the store.

use crate::gateway::ImageDelivery;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Frame size for streamed images.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub struct DeliveryBody {
    remaining: Bytes,
    delivery: Option<ImageDelivery>,
}

impl DeliveryBody {
    pub fn new(mut delivery: ImageDelivery) -> Self {
        let remaining = Bytes::from(delivery.take_bytes());
        Self {
            remaining,
            delivery: Some(delivery),
        }
    }

    fn finish(&mut self) {
        let Some(delivery) = self.delivery.take() else {
            return;
        };

        // Blob deletion is blocking file I/O.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let _ = delivery.confirm();
                });
            }
            Err(_) => {
                let _ = delivery.confirm();
            }
        }
    }
}

impl Body for DeliveryBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining.is_empty() {
            this.finish();
            return Poll::Ready(None);
        }

        let take = this.remaining.len().min(CHUNK_SIZE);
        let chunk = this.remaining.split_to(take);
        if this.remaining.is_empty() {
            this.finish();
        }
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining.is_empty() && self.delivery.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining.len() as u64)
    }
}
