use realtime_region_heap::Heap;

fn main() {
    let mut region = vec![0u8; 1 << 16];
    let mut heap = unsafe { Heap::create(region.as_mut_ptr(), region.len()) }.unwrap();

    println!("bytes free at start: {}", heap.bytes_free());

    let a = heap.alloc(64).expect("allocation failed");
    let b = heap.alloc(256).expect("allocation failed");
    println!("bytes free after two allocs: {}", heap.bytes_free());

    unsafe { heap.free(Some(a)) };
    println!("bytes free after freeing one: {}", heap.bytes_free());

    unsafe { heap.free(Some(b)) };
    println!("bytes free after freeing both: {}", heap.bytes_free());
}
