use super::*;

#[test]
fn test_rejects_malformed_filters() {
    assert_eq!(BloomFilter::new(vec![0], 8, 1), Err(BloomFilterError::InvalidPadding(8)));
    assert_eq!(
        BloomFilter::new(Vec::new(), 1, 1),
        Err(BloomFilterError::InvalidPaddingForEmptyBitmap(1))
    );
    assert_eq!(BloomFilter::new(vec![0xff], 0, 0), Err(BloomFilterError::InvalidHashCount(0)));
}

#[test]
fn test_empty_filter_contains_nothing() {
    let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
    assert_eq!(filter.bit_count(), 0);
    assert!(!filter.might_contain(""));
    assert!(!filter.might_contain("projects/p/databases/d/documents/rooms/a"));
}

#[test]
fn test_bit_count_subtracts_padding() {
    let filter = BloomFilter::new(vec![0, 0], 3, 2).unwrap();
    assert_eq!(filter.bit_count(), 13);
}

#[test]
fn test_inserted_members_are_found() {
    let mut filter = BloomFilter::with_size(100, 7);
    let members: Vec<String> = (0..10).map(|i| format!("rooms/doc{}", i)).collect();
    for member in &members {
        filter.insert(member);
    }
    for member in &members {
        assert!(filter.might_contain(member));
    }
}

#[test]
fn test_filter_survives_wire_form() {
    let mut filter = BloomFilter::with_size(61, 3);
    filter.insert("rooms/a");
    let data = filter.to_data();
    assert_eq!(data.padding, 3);
    assert_eq!(data.bitmap.len(), 8);

    let decoded = BloomFilter::from_data(&data).unwrap();
    assert_eq!(decoded, filter);
    assert!(decoded.might_contain("rooms/a"));
}

#[test]
fn test_all_zero_bitmap_rejects_members() {
    let filter = BloomFilter::new(vec![0; 4], 0, 5).unwrap();
    assert!(!filter.might_contain("rooms/a"));
}

#[test]
fn test_all_one_bitmap_accepts_everything() {
    let filter = BloomFilter::new(vec![0xff; 4], 0, 5).unwrap();
    assert!(filter.might_contain("rooms/a"));
    assert!(filter.might_contain("anything"));
}
