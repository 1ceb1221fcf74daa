pub extern crate anyhow;
pub extern crate bincode;
pub extern crate bytes;
pub extern crate tokio_util;

/// Declares a length-delimited bincode codec that writes `encode` frames
/// and reads `decode` frames.
///
/// ```ignore
/// codec!(ServerCodec, encode: Reply, decode: Request);
/// let framed = Framed::new(tcp, ServerCodec::new());
/// ```
#[macro_export]
macro_rules! codec {
    ($codec:ident, encode: $en_item:ty, decode: $de_item:ty $(,)?) => {
        pub struct $codec {
            len_codec: $crate::macros::codec::tokio_util::codec::LengthDelimitedCodec,
        }

        impl $codec {
            pub fn new() -> Self {
                Self {
                    len_codec: $crate::macros::codec::tokio_util::codec::LengthDelimitedCodec::new(),
                }
            }
        }

        impl Default for $codec {
            fn default() -> Self {
                Self::new()
            }
        }

        const _: () = {
            use $crate::macros::codec::bytes::BytesMut;
            use $crate::macros::codec::tokio_util::codec::{Decoder, Encoder};

            impl Encoder<$en_item> for $codec {
                type Error = $crate::macros::codec::anyhow::Error;

                fn encode(
                    &mut self,
                    item: $en_item,
                    dst: &mut BytesMut,
                ) -> ::std::result::Result<(), Self::Error> {
                    let msg = $crate::macros::codec::bincode::serialize(&item)?;
                    self.len_codec
                        .encode($crate::macros::codec::bytes::Bytes::from(msg), dst)?;
                    Ok(())
                }
            }

            impl Decoder for $codec {
                type Item = $de_item;

                type Error = $crate::macros::codec::anyhow::Error;

                fn decode(
                    &mut self,
                    src: &mut BytesMut,
                ) -> ::std::result::Result<Option<Self::Item>, Self::Error> {
                    match self.len_codec.decode(src)? {
                        Some(bytes) => Ok(Some($crate::macros::codec::bincode::deserialize(&*bytes)?)),
                        None => Ok(None),
                    }
                }
            }
        };
    };
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use serde::{Deserialize, Serialize};
    use tokio_util::codec::{Decoder, Encoder};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    pub struct Ping {
        seq: u32,
        body: String,
    }

    codec!(PingCodec, encode: Ping, decode: Ping);

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = PingCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Ping {
                    seq: 7,
                    body: "hello".into(),
                },
                &mut buf,
            )
            .unwrap();

        let mut head = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        let ping = codec.decode(&mut head).unwrap().unwrap();
        assert_eq!(ping.seq, 7);
        assert_eq!(ping.body, "hello");
    }
}
