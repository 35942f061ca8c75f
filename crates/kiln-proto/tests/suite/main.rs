mod decode_proptest;
