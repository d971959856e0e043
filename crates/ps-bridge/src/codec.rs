use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

/// 4-byte big-endian length prefix followed by a JSON payload.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub fn framed<S>(stream: S, max_frame_bytes: usize) -> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, frame_codec(max_frame_bytes))
}
